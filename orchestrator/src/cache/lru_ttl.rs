//! Count-bounded LRU cache whose entries expire after a fixed timeout

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::clock::{self, SharedClock};

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct LruTtlCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
    timeout: chrono::Duration,
    clock: SharedClock,
}

impl<K: Hash + Eq, V: Clone> LruTtlCache<K, V> {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self::with_clock(capacity, timeout, clock::system())
    }

    pub fn with_clock(capacity: usize, timeout: Duration, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            timeout: chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36500)),
            clock,
        }
    }

    /// Value for `key`; an expired entry is evicted and reported as a miss
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Insert or overwrite, restarting the entry's timeout
    pub fn add(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.timeout;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(key, Entry { value, expires_at });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.pop(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
