//! Capacity-bounded "seen recently" set.
//!
//! Used by consumers as the duplicate-suppression window. Eviction follows
//! insertion order only: re-inserting a key that is already present does not
//! refresh its position, so the window is a sliding record of first sightings
//! rather than an access-ordered LRU.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Insertion-ordered set that never holds more than `capacity` keys.
pub struct RecentSet<K> {
    // ---
    capacity: usize,
    members: HashSet<K>,
    order: VecDeque<K>,
}

impl<K> RecentSet<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty window. A capacity of zero keeps nothing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            members: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns true if `key` is currently inside the window.
    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    /// Record `key`. Returns `false` if it was already present.
    ///
    /// When the window is full the oldest key is evicted first.
    pub fn insert(&mut self, key: K) -> bool {
        // ---
        if self.capacity == 0 || self.members.contains(&key) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }

        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Change the capacity, evicting the oldest keys if the window shrinks.
    pub fn resize(&mut self, capacity: usize) {
        // ---
        self.capacity = capacity;
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
