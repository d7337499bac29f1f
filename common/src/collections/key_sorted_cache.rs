//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::BTreeMap;

/// A bounded map that holds on to the largest keys. Inserting past the limit
/// evicts the smallest key, so the window follows the newest sequence numbers
/// and frame ids as a stream advances.
pub struct KeySortedCache<K, V> {
    limit: usize,
    value_by_key: BTreeMap<K, V>,
}

impl<K: Ord, V> KeySortedCache<K, V> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            value_by_key: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.value_by_key.insert(key, value);
        if self.value_by_key.len() > self.limit {
            self.value_by_key.pop_first();
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.value_by_key.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.value_by_key.contains_key(key)
    }

    /// Iterates from the smallest key to the largest.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.value_by_key.iter()
    }

    pub fn clear(&mut self) {
        self.value_by_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_overfill() {
        let mut cache = KeySortedCache::new(2);
        cache.insert(1, "A");
        cache.insert(2, "B");
        assert_eq!(
            vec![(&1, &"A"), (&2, &"B")],
            cache.iter().collect::<Vec<_>>()
        );

        cache.insert(3, "C");
        assert_eq!(
            vec![(&2, &"B"), (&3, &"C")],
            cache.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn overfill_with_lower_key_drops_that_key() {
        let mut cache = KeySortedCache::new(2);
        cache.insert(2, "B");
        cache.insert(3, "C");
        cache.insert(1, "A");

        assert_eq!(
            vec![(&2, &"B"), (&3, &"C")],
            cache.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn overfill_with_middle_key() {
        let mut cache = KeySortedCache::new(2);
        cache.insert(1, "A");
        cache.insert(3, "C");
        cache.insert(2, "B");

        assert_eq!(
            vec![(&2, &"B"), (&3, &"C")],
            cache.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn replace_key_does_not_evict() {
        let mut cache = KeySortedCache::new(2);
        cache.insert(1, "A");
        cache.insert(2, "B");
        cache.insert(1, "C");

        assert_eq!(
            vec![(&1, &"C"), (&2, &"B")],
            cache.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn lookups() {
        let mut cache = KeySortedCache::new(3);
        cache.insert(1, "A");
        cache.insert(2, "B");
        assert_eq!(Some(&"A"), cache.get(&1));
        assert_eq!(None, cache.get(&3));
        assert!(cache.contains_key(&2));
        assert!(!cache.contains_key(&3));
    }

    #[test]
    fn clear_empties_the_window() {
        let mut cache = KeySortedCache::new(4);
        cache.insert(1, "A");
        cache.insert(2, "B");
        cache.clear();
        assert_eq!(0, cache.iter().count());

        // The limit survives a clear.
        cache.insert(3, "C");
        cache.insert(4, "D");
        cache.insert(5, "E");
        cache.insert(6, "F");
        cache.insert(7, "G");
        assert_eq!(4, cache.iter().count());
        assert!(!cache.contains_key(&3));
    }
}
