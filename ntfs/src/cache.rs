// Generation-checked LRU cache for metadata records and index blocks
// Every key carries a generation; invalidation bumps it, so an entry cached
// before a structural change can never be served afterwards

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    generation: u64,
    last_used: u64,
}

#[derive(Debug)]
pub struct ObjectCache<K, V> {
    capacity: usize,
    slots: HashMap<K, Slot<V>>,
    generations: HashMap<K, u64>,
    // last_used tick -> key
    lru: BTreeMap<u64, K>,
    tick: u64,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V: Clone> ObjectCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            generations: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn generation(&self, key: &K) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let current = self.generation(key);
        let Some(slot) = self.slots.get_mut(key) else {
            self.stats.misses += 1;
            return None;
        };
        if slot.generation != current {
            let last_used = slot.last_used;
            self.slots.remove(key);
            self.lru.remove(&last_used);
            self.stats.stale += 1;
            return None;
        }
        self.tick += 1;
        self.lru.remove(&slot.last_used);
        slot.last_used = self.tick;
        self.lru.insert(self.tick, key.clone());
        self.stats.hits += 1;
        Some(slot.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        let generation = self.generation(&key);
        if let Some(old) = self.slots.insert(
            key.clone(),
            Slot { value, generation, last_used: self.tick },
        ) {
            self.lru.remove(&old.last_used);
        }
        self.lru.insert(self.tick, key);

        while self.slots.len() > self.capacity {
            let Some((_, victim)) = self.lru.pop_first() else { break };
            self.slots.remove(&victim);
            self.stats.evictions += 1;
        }
    }

    /// Make any cached copy of `key` unreachable.
    pub fn invalidate(&mut self, key: &K) {
        *self.generations.entry(key.clone()).or_insert(0) += 1;
    }

    /// Invalidate every key matching `pred`.
    pub fn invalidate_where<F: Fn(&K) -> bool>(&mut self, pred: F) {
        let keys: Vec<K> = self.slots.keys().filter(|k| pred(k)).cloned().collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_eviction_order() {
        let mut cache = ObjectCache::new(2);
        cache.insert(1u64, "one");
        cache.insert(2u64, "two");
        assert_eq!(cache.get(&1), Some("one"));
        cache.insert(3u64, "three");
        // 2 was least recently used
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidation_bumps_generation() {
        let mut cache = ObjectCache::new(4);
        cache.insert(7u64, vec![1u8]);
        cache.invalidate(&7);
        assert_eq!(cache.generation(&7), 1);
        assert_eq!(cache.get(&7), None);
        assert_eq!(cache.stats().stale, 1);

        // Fresh inserts are stamped with the new generation
        cache.insert(7u64, vec![2u8]);
        assert_eq!(cache.get(&7), Some(vec![2u8]));
    }

    #[test]
    fn test_invalidate_where() {
        let mut cache = ObjectCache::new(8);
        for vcn in 0..4u64 {
            cache.insert((5u64, vcn), vcn);
            cache.insert((6u64, vcn), vcn);
        }
        cache.invalidate_where(|k| k.0 == 5);
        assert_eq!(cache.get(&(5, 2)), None);
        assert_eq!(cache.get(&(6, 2)), Some(2));
    }
}
