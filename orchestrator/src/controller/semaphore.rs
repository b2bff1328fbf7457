//! Named `namespace/name` locks gating workflow execution

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use tracing::{debug, info};
use workflow_api::Workflow;

#[derive(Debug, Default)]
struct Semaphore {
    limit: usize,
    holders: BTreeSet<String>,
    waiters: VecDeque<String>,
}

impl Semaphore {
    fn available(&self) -> usize {
        self.limit.saturating_sub(self.holders.len())
    }
}

/// Lock key and limit a workflow must acquire before it runs
pub fn lock_for(wf: &Workflow) -> Option<(String, usize)> {
    let sync = wf.spec.synchronization.as_ref()?;
    if let Some(mutex) = &sync.mutex {
        return Some((format!("{}/{}", wf.namespace(), mutex.name), 1));
    }
    let semaphore = sync.semaphore.as_ref()?;
    Some((
        format!("{}/{}", wf.namespace(), semaphore.name),
        semaphore.limit.unwrap_or(1).max(1),
    ))
}

/// In-process semaphore table
///
/// Holders and waiters are workflow keys. Waiters are served in arrival
/// order; with indexing on, `release` returns the waiters that may now
/// proceed so the caller can requeue them.
#[derive(Debug, Default)]
pub struct SemaphoreManager {
    locks: Mutex<BTreeMap<String, Semaphore>>,
    index_waiters: bool,
}

impl SemaphoreManager {
    pub fn new(index_waiters: bool) -> Self {
        Self {
            locks: Mutex::new(BTreeMap::new()),
            index_waiters,
        }
    }

    /// Take a slot of `lock` for `holder`; acquiring twice is a no-op
    pub fn try_acquire(&self, lock: &str, limit: usize, holder: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let semaphore = locks.entry(lock.to_string()).or_default();
        semaphore.limit = limit;
        if semaphore.holders.contains(holder) {
            return true;
        }
        let position = semaphore.waiters.iter().position(|w| w == holder);
        let turn = match position {
            Some(index) => index < semaphore.available(),
            None => semaphore.waiters.is_empty() || semaphore.waiters.len() < semaphore.available(),
        };
        if semaphore.available() > 0 && turn {
            if let Some(index) = position {
                semaphore.waiters.remove(index);
            }
            semaphore.holders.insert(holder.to_string());
            info!(lock, holder, "acquired lock");
            return true;
        }
        if position.is_none() {
            semaphore.waiters.push_back(holder.to_string());
            debug!(lock, holder, "waiting for lock");
        }
        false
    }

    /// Release `holder`'s slot; returns waiters that should be requeued
    pub fn release(&self, lock: &str, holder: &str) -> Vec<String> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(semaphore) = locks.get_mut(lock) else {
            return Vec::new();
        };
        semaphore.waiters.retain(|w| w != holder);
        if !semaphore.holders.remove(holder) {
            return Vec::new();
        }
        info!(lock, holder, "released lock");
        if !self.index_waiters {
            return Vec::new();
        }
        semaphore
            .waiters
            .iter()
            .take(semaphore.available())
            .cloned()
            .collect()
    }

    pub fn holders(&self, lock: &str) -> Vec<String> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(lock)
            .map(|s| s.holders.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_api::workflow::{SemaphoreRef, Synchronization};
    use workflow_api::ObjectMeta;

    #[test]
    fn test_lock_for() {
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", "wf"),
            ..Default::default()
        };
        assert_eq!(lock_for(&wf), None);
        wf.spec.synchronization = Some(Synchronization {
            semaphore: Some(SemaphoreRef {
                name: "gpu".to_string(),
                limit: Some(2),
            }),
            mutex: None,
        });
        assert_eq!(lock_for(&wf), Some(("argo/gpu".to_string(), 2)));
    }

    #[test]
    fn test_fifo_acquire_and_release() {
        let manager = SemaphoreManager::new(true);
        assert!(manager.try_acquire("argo/m", 1, "argo/a"));
        assert!(manager.try_acquire("argo/m", 1, "argo/a"));
        assert!(!manager.try_acquire("argo/m", 1, "argo/b"));
        assert!(!manager.try_acquire("argo/m", 1, "argo/c"));

        assert_eq!(manager.release("argo/m", "argo/a"), vec!["argo/b"]);
        assert!(!manager.try_acquire("argo/m", 1, "argo/c"));
        assert!(manager.try_acquire("argo/m", 1, "argo/b"));
        assert_eq!(manager.holders("argo/m"), vec!["argo/b"]);
        assert!(manager.release("argo/m", "argo/nobody").is_empty());
    }

    #[test]
    fn test_release_without_index_returns_nothing() {
        let manager = SemaphoreManager::new(false);
        assert!(manager.try_acquire("argo/s", 2, "argo/a"));
        assert!(manager.try_acquire("argo/s", 2, "argo/b"));
        assert!(!manager.try_acquire("argo/s", 2, "argo/c"));
        assert!(manager.release("argo/s", "argo/a").is_empty());
        assert!(manager.try_acquire("argo/s", 2, "argo/c"));
    }
}
