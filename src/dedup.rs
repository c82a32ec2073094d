//! Bounded record of envelope ids already processed.
//!
//! Flooding terminates because every node forwards an envelope at most once:
//! the router checks each id here before merging or rebroadcasting. The cache
//! is bounded, so an id evicted long ago can be processed again. That is
//! harmless because merges are idempotent and a re-merge that changes nothing
//! does not rebroadcast.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Number of envelope ids remembered before the oldest is evicted.
pub const DEFAULT_DEDUP_CAPACITY: usize = 100;

/// FIFO set of recently seen envelope ids.
///
/// Backed by an [`LruCache`], but lookups never promote an entry, so eviction
/// order is insertion order.
#[derive(Debug)]
pub struct DedupCache {
    entries: LruCache<String, ()>,
}

impl DedupCache {
    /// Capacity 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Record `id`. Returns `true` if it was not already present.
    ///
    /// A repeat sighting does not refresh the entry's position.
    pub fn observe(&mut self, id: &str) -> bool {
        if self.entries.contains(id) {
            return false;
        }
        self.entries.put(id.to_owned(), ());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_wins() {
        let mut cache = DedupCache::default();
        assert!(cache.observe("a"));
        assert!(!cache.observe("a"));
        assert!(cache.observe("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let k = DEFAULT_DEDUP_CAPACITY;
        let mut cache = DedupCache::new(k);
        for i in 0..=k {
            assert!(cache.observe(&format!("id-{i}")));
        }

        assert_eq!(cache.len(), k);
        assert!(!cache.contains("id-0"), "first id should be evicted");
        assert!(cache.contains("id-1"));
        assert!(cache.contains(&format!("id-{k}")));

        // Evicted id is accepted again.
        assert!(cache.observe("id-0"));
        assert!(!cache.contains("id-1"));
    }

    #[test]
    fn repeat_sighting_does_not_refresh() {
        let mut cache = DedupCache::new(3);
        cache.observe("a");
        cache.observe("b");
        cache.observe("c");

        // Seeing "a" again must not move it to the back of the queue.
        assert!(!cache.observe("a"));
        cache.observe("d");

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.observe("x"));
        assert!(!cache.observe("x"));
        assert!(cache.observe("y"));
        assert!(!cache.contains("x"));
    }
}
