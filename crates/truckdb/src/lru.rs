//! A fixed-capacity, recency-ordered cache.
//!
//! The workspace denies `unsafe_code`, so recency is tracked with a
//! monotonic logical clock and a `BTreeMap` ordering rather than an
//! intrusive doubly-linked list: `get` and `put` both bump an entry's tick
//! and re-index it, and eviction simply pops the smallest tick. This keeps
//! every operation safe Rust at the cost of an O(log n) eviction instead of
//! O(1), which is immaterial at the capacities this cache runs at (tens of
//! thousands of entries).

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
pub struct Lru<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K, V> Lru<K, V>
where
    K: Eq + Hash + Clone + Ord,
    V: Clone,
{
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be > 0");
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let (value, old_tick) = self.entries.get(key).cloned()?;
        self.order.remove(&old_tick);
        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        self.entries.insert(key.clone(), (value.clone(), tick));
        Some(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn put(&mut self, key: K, value: V) {
        if let Some((_, old_tick)) = self.entries.get(&key) {
            self.order.remove(old_tick);
        }
        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        self.entries.insert(key, (value, tick));

        while self.entries.len() > self.capacity {
            if let Some((&oldest_tick, _)) = self.order.iter().next() {
                let oldest_key = self.order.remove(&oldest_tick).unwrap();
                self.entries.remove(&oldest_key);
            } else {
                break;
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, tick) = self.entries.remove(key)?;
        self.order.remove(&tick);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_put_and_get() {
        let mut cache: Lru<&str, i32> = Lru::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache: Lru<&str, i32> = Lru::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        // touch a so b becomes the least recently used
        cache.get(&"a");
        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn put_on_existing_key_refreshes_recency() {
        let mut cache: Lru<&str, i32> = Lru::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 10);
        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(10));
    }

    #[test]
    fn remove_and_clear() {
        let mut cache: Lru<&str, i32> = Lru::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _cache: Lru<&str, i32> = Lru::new(0);
    }

    #[test]
    fn capacity_one_keeps_only_latest() {
        let mut cache: Lru<&str, i32> = Lru::new(1);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
    }
}
