use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

struct Slot<V> {
    value: V,
    touched: AtomicU64,
}

/// Bounded map for long-lived per-key state (breakers, peers, retry
/// samples). Inserting into a full map evicts the least recently touched
/// eighth of the entries in one pass, so the scan runs once per
/// `capacity / 8` inserts rather than on every insert.
pub struct KeyedCache<V> {
    map: RwLock<HashMap<String, Slot<V>>>,
    capacity: usize,
    tick: AtomicU64,
}

impl<V: Clone> KeyedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
        }
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let map = self.map.read();
        map.get(key).map(|slot| {
            slot.touched.store(self.next_tick(), Ordering::Relaxed);
            slot.value.clone()
        })
    }

    pub fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(key) {
            return v;
        }
        let mut map = self.map.write();
        if let Some(slot) = map.get(key) {
            slot.touched.store(self.next_tick(), Ordering::Relaxed);
            return slot.value.clone();
        }
        self.evict_if_full(&mut map);
        let value = make();
        map.insert(key.to_string(), Slot {
            value: value.clone(),
            touched: AtomicU64::new(self.next_tick()),
        });
        value
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut map = self.map.write();
        if !map.contains_key(key) {
            self.evict_if_full(&mut map);
        }
        map.insert(key.to_string(), Slot {
            value,
            touched: AtomicU64::new(self.next_tick()),
        });
    }

    fn evict_if_full(&self, map: &mut HashMap<String, Slot<V>>) {
        if map.len() < self.capacity {
            return;
        }
        let batch = (self.capacity / 8).max(1);
        let mut ages: Vec<(u64, &String)> = map.iter()
            .map(|(k, slot)| (slot.touched.load(Ordering::Relaxed), k))
            .collect();
        if batch < ages.len() {
            ages.select_nth_unstable_by_key(batch - 1, |(touched, _)| *touched);
            ages.truncate(batch);
        }
        let victims: Vec<String> = ages.into_iter().map(|(_, k)| k.clone()).collect();
        tracing::debug!(evicted = victims.len(), capacity = self.capacity, "evicting least recently used entries");
        for k in victims {
            map.remove(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        self.map.read()
            .iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }
}
