//! Sharded hash map with per-shard locking
//!
//! Keys are routed to one of N shards by hash; each shard is an ordinary
//! `HashMap` behind its own `RwLock`, so operations on different shards
//! never contend. N is the next power of two at or above twice the expected
//! parallelism, which keeps the modulo a mask.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use parking_lot::RwLock;

use crate::config::default_parallelism;

/// A concurrent hash map sharded across independently locked segments.
pub struct ShardedMap<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    hasher: RandomState,
    mask: usize,
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash,
{
    /// Create a map sized for the hardware parallelism of this host.
    pub fn new() -> Self {
        Self::with_parallelism(default_parallelism())
    }

    /// Create a map sized for the given expected parallelism.
    pub fn with_parallelism(parallelism: usize) -> Self {
        let shard_count = (parallelism.max(1) * 2).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            mask: shard_count - 1,
        }
    }

    /// Number of internal shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let idx = self.hasher.hash_one(key) as usize & self.mask;
        &self.shards[idx]
    }

    /// Insert a key-value pair, returning the previous value if present.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).write().insert(key, value)
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard_for(key).write().remove(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.shard_for(key).read().contains_key(key)
    }

    /// Approximate number of entries: shard lengths are summed without a
    /// global lock, so concurrent writers can skew the total. Exact under
    /// quiescence.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether the map is empty (approximate, like [`len`](Self::len)).
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Remove all entries. Shard locks are taken in index order and held
    /// together so a concurrent observer sees either the old or the empty
    /// map, never a partial clear.
    pub fn clear(&self) {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();
        for guard in guards.iter_mut() {
            guard.clear();
        }
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Get a clone of the value for the key.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard_for(key).read().get(key).cloned()
    }

    /// Get the value for the key, or a default when absent.
    pub fn get_or(&self, key: &K, default: V) -> V {
        self.get(key).unwrap_or(default)
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Snapshot of all entries, taken one shard at a time. No ordering is
    /// guaranteed across shards, and entries written mid-iteration may or
    /// may not appear.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.read();
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Snapshot of all keys, with the same guarantees as
    /// [`entries`](Self::entries).
    pub fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.read().keys().cloned());
        }
        out
    }
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
