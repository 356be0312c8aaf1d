//! Duplicate suppression for replayed listener events
//!
//! Listener reconnects and full resyncs redeliver events the engine has
//! already applied. A bounded LRU set of recently applied canonical ids
//! absorbs those replays before they reach the merge path; the store's
//! correlation/canonical indexes remain the backstop for anything that ages
//! out of the window.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::types::CanonicalId;

// ----------------------------------------------------------------------------
// Recent Id Cache
// ----------------------------------------------------------------------------

/// Bounded LRU set of recently applied canonical ids
#[derive(Debug)]
pub struct RecentIdCache {
    capacity: usize,
    /// Monotonic recency counter
    tick: u64,
    /// id → last-seen tick
    by_id: HashMap<CanonicalId, u64>,
    /// last-seen tick → id, for oldest-first eviction
    by_age: BTreeMap<u64, CanonicalId>,
}

impl RecentIdCache {
    /// Create a cache holding at most `capacity` ids
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            by_id: HashMap::new(),
            by_age: BTreeMap::new(),
        }
    }

    /// Observe a canonical id
    ///
    /// Returns true if the id is fresh (and records it), false if it was
    /// already in the window (refreshing its recency).
    pub fn observe(&mut self, id: &CanonicalId) -> bool {
        self.tick += 1;
        if let Some(previous) = self.by_id.insert(id.clone(), self.tick) {
            self.by_age.remove(&previous);
            self.by_age.insert(self.tick, id.clone());
            return false;
        }

        self.by_age.insert(self.tick, id.clone());
        if self.by_id.len() > self.capacity {
            if let Some((&oldest, _)) = self.by_age.iter().next() {
                if let Some(evicted) = self.by_age.remove(&oldest) {
                    self.by_id.remove(&evicted);
                }
            }
        }
        true
    }

    /// Whether the id is currently in the window
    pub fn contains(&self, id: &CanonicalId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Number of ids currently tracked
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> CanonicalId {
        CanonicalId::new(format!("msg-{n}"))
    }

    #[test]
    fn test_fresh_then_duplicate() {
        let mut cache = RecentIdCache::new(8);
        assert!(cache.observe(&id(1)));
        assert!(!cache.observe(&id(1)));
        assert!(cache.contains(&id(1)));
    }

    #[test]
    fn test_evicts_least_recently_seen() {
        let mut cache = RecentIdCache::new(3);
        for n in 1..=3 {
            assert!(cache.observe(&id(n)));
        }
        // Touch id 1 so id 2 becomes the oldest
        assert!(!cache.observe(&id(1)));

        assert!(cache.observe(&id(4)));
        assert!(!cache.contains(&id(2)));
        assert!(cache.contains(&id(1)));
        assert!(cache.contains(&id(3)));
        assert!(cache.contains(&id(4)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_evicted_id_reads_as_fresh_again() {
        // The store's indexes are the backstop for ids that age out; the
        // cache itself simply reports them as fresh.
        let mut cache = RecentIdCache::new(2);
        assert!(cache.observe(&id(1)));
        assert!(cache.observe(&id(2)));
        assert!(cache.observe(&id(3)));
        assert!(cache.observe(&id(1)));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = RecentIdCache::new(0);
        assert!(cache.observe(&id(1)));
        assert!(!cache.observe(&id(1)));
    }
}
