//! Hash map that iterates in insertion order.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Hash map remembering the order keys were first inserted.
///
/// Replacing the value of an existing key keeps its position; removing and
/// re-inserting moves it to the end.
#[derive(Debug, Clone)]
pub struct LinkedMap<K, V> {
    next_seq: u64,
    order: BTreeMap<u64, K>,
    entries: HashMap<K, (u64, V)>,
}

impl<K, V> Default for LinkedMap<K, V> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            order: BTreeMap::new(),
            entries: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash, V> LinkedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some((_, existing)) = self.entries.get_mut(&key) {
            return Some(std::mem::replace(existing, value));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key);
        self.entries.insert(key, (seq, value));
        None
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (seq, value) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = K> {
        self.order.values().copied()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.order
            .values()
            .filter_map(|k| self.entries.get(k).map(|(_, v)| (*k, v)))
    }

    /// Values in arbitrary order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterates_in_insertion_order() {
        let mut map = LinkedMap::new();
        map.insert(3, "c");
        map.insert(1, "a");
        map.insert(2, "b");
        assert_eq!(map.iter().map(|(k, _)| k).collect::<Vec<_>>(), vec![3, 1, 2]);

        assert_eq!(map.insert(1, "A"), Some("a"));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![3, 1, 2]);

        map.remove(&3);
        map.insert(3, "C");
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(map.get(&3), Some(&"C"));
        assert_eq!(map.len(), 3);
    }
}
