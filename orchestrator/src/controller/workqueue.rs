//! Deduplicating, delaying, rate-limited work queue
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! being processed marks it dirty; [`WorkQueue::done`] puts it back once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key exponential backoff, 5 ms doubling up to 1000 s
pub fn rate_limit_delay(failures: u32) -> Duration {
    let factor = 2f64.powi(failures.min(64) as i32);
    let delay = BASE_DELAY.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(MAX_DELAY.as_secs_f64()))
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_locked(state: &mut State<K>, key: K) -> bool {
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return false;
        }
        if state.processing.contains(&key) {
            return false;
        }
        state.queue.push_back(key);
        true
    }

    pub fn add(&self, key: K) {
        let queued = Self::add_locked(&mut self.lock(), key);
        if queued {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed; an earlier pending deadline wins
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let entry = state.waiting.entry(key).or_insert(ready_at);
            if ready_at < *entry {
                *entry = ready_at;
            }
        }
        // wake a worker so it sleeps until the new deadline
        self.inner.notify.notify_one();
    }

    pub fn add_rate_limited(&self, key: K) {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            let failures = *count;
            *count += 1;
            failures
        };
        self.add_after(key, rate_limit_delay(failures));
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Time left before a delayed `key` becomes ready
    pub fn pending_delay(&self, key: &K) -> Option<Duration> {
        self.lock()
            .waiting
            .get(key)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Next key to process, or `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let next_wake = {
                let mut state = self.lock();
                let now = Instant::now();
                let ready: Vec<K> = state
                    .waiting
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in ready {
                    state.waiting.remove(&key);
                    Self::add_locked(&mut state, key);
                }

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    self.inner.notify.notify_one();
                    return None;
                }
                state.waiting.values().min().copied()
            };

            match next_wake {
                Some(at) => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.inner.notify.notified().await,
            }
        }
    }

    /// Mark `key` finished; it is queued again if it was added meanwhile
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deduplicates() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_on_done() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        // not handed to a second worker
        assert_eq!(queue.len(), 0);
        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_after() {
        let queue = WorkQueue::new();
        queue.add_after("late", Duration::from_millis(30));
        assert!(queue.is_empty());
        assert!(queue.pending_delay(&"late").is_some());
        let started = Instant::now();
        assert_eq!(queue.get().await, Some("late"));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_rate_limit_backoff() {
        assert_eq!(rate_limit_delay(0), Duration::from_millis(5));
        assert_eq!(rate_limit_delay(1), Duration::from_millis(10));
        assert_eq!(rate_limit_delay(40), Duration::from_secs(1000));

        let queue = WorkQueue::new();
        queue.add_rate_limited("k");
        queue.add_rate_limited("k");
        assert_eq!(queue.num_requeues(&"k"), 2);
        queue.forget(&"k");
        assert_eq!(queue.num_requeues(&"k"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers() {
        let queue: WorkQueue<String> = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);
        queue.add("ignored".to_string());
        assert!(queue.is_empty());
    }
}
