//! Bounded cache of recently observed dedupe keys.
//!
//! Protects an actor against repeated firings of the same logical request:
//! a fire whose key is already present is acknowledged as a no-op instead
//! of producing a second event. Membership is exact; eviction drops the
//! least-recently-added key once capacity is reached.
//!
//! The cache is owned by one actor and accessed under its single-writer
//! discipline, so there is no interior locking. Its contents travel inside
//! snapshots as a bounded, oldest-first list.

use std::collections::{HashSet, VecDeque};

/// Default capacity, matching `MaxDedupeKeysInMemory`.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 1000;

/// Bounded set of dedupe keys with insertion-order eviction.
#[derive(Debug)]
pub struct DedupeCache {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl DedupeCache {
    /// Create a cache bounded at `capacity` keys.
    ///
    /// A capacity of zero disables the cache: nothing is retained and
    /// every fire is admitted.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Exact membership test.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Record a key, evicting the oldest if full.
    ///
    /// Returns `false` when the key was already present (the duplicate
    /// case), `true` when it was newly added.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let key = key.into();
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.keys.remove(&evicted);
            }
        }
        true
    }

    /// Number of keys currently retained.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no keys are retained.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Export retained keys oldest-first, for snapshots.
    pub fn export(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    /// Rebuild the cache from a snapshot's key list.
    ///
    /// Keys beyond capacity are dropped from the old end, preserving the
    /// newest entries.
    pub fn restore(&mut self, keys: Vec<String>) {
        self.order.clear();
        self.keys.clear();
        let skip = keys.len().saturating_sub(self.capacity);
        for key in keys.into_iter().skip(skip) {
            if self.keys.insert(key.clone()) {
                self.order.push_back(key);
            }
        }
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DEDUPE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut cache = DedupeCache::with_capacity(10);
        assert!(!cache.contains("a"));
        assert!(cache.insert("a"));
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_duplicate_insert_returns_false() {
        let mut cache = DedupeCache::with_capacity(10);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_drops_least_recently_added() {
        let mut cache = DedupeCache::with_capacity(3);
        cache.insert("a");
        cache.insert("b");
        cache.insert("c");
        cache.insert("d");
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        let mut cache = DedupeCache::with_capacity(5);
        for i in 0..100 {
            cache.insert(format!("key-{i}"));
            assert!(cache.len() <= 5);
        }
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = DedupeCache::with_capacity(0);
        assert!(cache.insert("a"));
        assert!(!cache.contains("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_export_is_oldest_first() {
        let mut cache = DedupeCache::with_capacity(10);
        cache.insert("a");
        cache.insert("b");
        cache.insert("c");
        assert_eq!(cache.export(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_restore_round_trips() {
        let mut cache = DedupeCache::with_capacity(10);
        cache.insert("a");
        cache.insert("b");
        let exported = cache.export();

        let mut restored = DedupeCache::with_capacity(10);
        restored.restore(exported);
        assert!(restored.contains("a"));
        assert!(restored.contains("b"));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_restore_keeps_newest_when_over_capacity() {
        let mut cache = DedupeCache::with_capacity(2);
        cache.restore(vec!["old".into(), "mid".into(), "new".into()]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("old"));
        assert!(cache.contains("mid"));
        assert!(cache.contains("new"));
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(DedupeCache::default().capacity(), DEFAULT_DEDUPE_CAPACITY);
    }
}
