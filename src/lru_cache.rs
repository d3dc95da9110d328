/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use fxhash::FxHashMap;
use std::hash::Hash;

struct Entry<V> {
    value: V,
    last_used: u64,
}

/// A map that holds at most `capacity` entries, evicting the least recently
/// used one on overflow. Evicted values are handed back to the caller, which
/// may own GPU resources that need explicit cleanup.
pub struct LruCache<K, V> {
    entries: FxHashMap<K, Entry<V>>,
    capacity: usize,
    clock: u64,
}

impl<K: Copy + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> LruCache<K, V> {
        debug_assert!(capacity > 0);
        LruCache {
            entries: FxHashMap::default(),
            capacity,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = clock;
            &mut entry.value
        })
    }

    /// Inserts `value`, returning whatever had to leave the cache to make room
    /// (or the previous value for the same key).
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.clock += 1;
        let entry = Entry { value, last_used: self.clock };
        if let Some(old) = self.entries.insert(key, entry) {
            return Some(old.value);
        }
        if self.entries.len() <= self.capacity {
            return None;
        }

        let oldest = self.entries
            .iter()
            .min_by_key(|&(_, entry)| entry.last_used)
            .map(|(key, _)| *key);
        oldest.and_then(|key| self.entries.remove(&key)).map(|entry| entry.value)
    }

    pub fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }
}
