//! Read-mostly locked dictionary
//!
//! A single `HashMap` behind one reader-writer lock. Simpler than
//! [`ShardedMap`](crate::concurrent::ShardedMap) and the better choice when
//! reads dominate and the map is small: readers proceed in parallel and a
//! snapshot is one lock acquisition.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// A dictionary guarded by a single reader-writer lock.
pub struct RwDict<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> RwDict<K, V>
where
    K: Eq + Hash,
{
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a key-value pair, returning the previous value if present.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write().insert(key, value)
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().remove(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl<K, V> RwDict<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Get a clone of the value for the key.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }
}

impl<K, V> RwDict<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Snapshot of the current keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }
}

impl<K, V> Default for RwDict<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let dict = RwDict::new();
        dict.insert("key1", 1);
        dict.insert("key2", 2);

        assert_eq!(dict.get(&"key1"), Some(1));
        assert!(dict.contains_key(&"key2"));
        assert!(!dict.contains_key(&"key3"));
        assert_eq!(dict.len(), 2);

        assert_eq!(dict.remove(&"key1"), Some(1));
        assert_eq!(dict.remove(&"key1"), None);

        dict.clear();
        assert!(dict.is_empty());
    }

    #[test]
    fn test_keys_snapshot() {
        let dict = RwDict::new();
        dict.insert("a", 1);
        dict.insert("b", 2);

        let mut keys = dict.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::Arc;

        let dict = Arc::new(RwDict::new());
        for i in 0..50 {
            dict.insert(i, i * i);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dict = Arc::clone(&dict);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        assert_eq!(dict.get(&i), Some(i * i));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
