//! Smart cache with pluggable eviction
//!
//! A concurrent key-value cache bounded by entry count. Entries carry the
//! metadata (insert time, last access, access count) that the eviction
//! policies need:
//! - **LRU**: evict the entry with the oldest last access
//! - **LFU**: evict the entry with the fewest accesses, older last access
//!   breaking ties
//! - **TTL**: expired entries are logically absent and swept on touch;
//!   capacity eviction removes the oldest insert
//! - **Adaptive**: behaves as LFU while the recent hit rate is at or above
//!   a threshold, as LRU otherwise
//!
//! Storage is sharded like [`ShardedMap`](crate::concurrent::ShardedMap);
//! victim selection scans shard snapshots so the policy sees every
//! candidate, not just the insert's home shard. Lookups and removals run
//! shard-parallel; inserts serialize on a capacity guard held across the
//! whole check-evict-insert sequence, which is what keeps `current_size`
//! at or below `max_size` under concurrent writers.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::default_parallelism;

/// Eviction policy, carrying its per-variant configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently used.
    Lru,
    /// Least frequently used.
    Lfu,
    /// Time-to-live expiry with oldest-insert capacity eviction.
    Ttl(Duration),
    /// LFU when the sliding-window hit rate is at or above `threshold`,
    /// LRU otherwise.
    Adaptive {
        /// Hit-rate boundary between the LFU and LRU regimes, in [0, 1].
        threshold: f64,
    },
}

/// Lookups per adaptive sliding window.
const ADAPTIVE_WINDOW: u64 = 256;

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry).
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Live entries right now.
    pub current_size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// `hits / (hits + misses)`, 0 when no lookups have happened.
    pub hit_rate: f64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// Concurrent bounded cache with pluggable eviction.
pub struct SmartCache<K, V> {
    shards: Box<[RwLock<HashMap<K, CacheEntry<V>>>]>,
    hasher: RandomState,
    mask: usize,
    max_size: usize,
    policy: EvictionPolicy,
    // Serializes inserts so the capacity check, the eviction, and the
    // insert act as one step; shard locks alone cannot span all three.
    put_guard: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    // Adaptive sliding window: hits and total lookups in the current
    // window, plus the rate of the last completed window in per-mille.
    window_hits: AtomicU64,
    window_total: AtomicU64,
    window_rate_mille: AtomicUsize,
}

impl<K, V> SmartCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an LRU cache holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self::with_policy(max_size, EvictionPolicy::Lru)
    }

    /// Create a cache with the given policy.
    pub fn with_policy(max_size: usize, policy: EvictionPolicy) -> Self {
        let shard_count = (default_parallelism() * 2).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            mask: shard_count - 1,
            max_size: max_size.max(1),
            policy,
            put_guard: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            window_hits: AtomicU64::new(0),
            window_total: AtomicU64::new(0),
            window_rate_mille: AtomicUsize::new(1000),
        }
    }

    /// Configured capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The eviction policy this cache was built with.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn shard_index(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & self.mask
    }

    fn ttl(&self) -> Option<Duration> {
        match self.policy {
            EvictionPolicy::Ttl(ttl) => Some(ttl),
            _ => None,
        }
    }

    /// Look up a key, updating its recency/frequency metadata on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let shard = &self.shards[self.shard_index(key)];
        let mut guard = shard.write();

        if let Some(ttl) = self.ttl() {
            if guard.get(key).map(|e| e.is_expired(ttl)).unwrap_or(false) {
                guard.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                drop(guard);
                self.record_lookup(false);
                return None;
            }
        }

        match guard.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                let value = entry.value.clone();
                drop(guard);
                self.record_lookup(true);
                Some(value)
            }
            None => {
                drop(guard);
                self.record_lookup(false);
                None
            }
        }
    }

    /// Insert a value, evicting per policy if the cache is full.
    pub fn put(&self, key: K, value: V) {
        // Held until the insert lands: concurrent puts must not act on
        // the same stale length and over-fill the cache.
        let _capacity = self.put_guard.lock();

        if let Some(ttl) = self.ttl() {
            self.sweep_expired(ttl);
        }

        let idx = self.shard_index(&key);
        {
            // Replacing an existing key never needs an eviction.
            let mut guard = self.shards[idx].write();
            if let Some(entry) = guard.get_mut(&key) {
                *entry = CacheEntry::new(value);
                return;
            }
        }

        // Removals by other threads can only shrink the cache while the
        // guard is held, so this loop terminates.
        while self.len() >= self.max_size {
            if !self.evict_one() {
                break;
            }
        }

        self.shards[idx].write().insert(key, CacheEntry::new(value));
    }

    /// Whether the key is present and live. Does not touch metadata.
    pub fn contains(&self, key: &K) -> bool {
        let guard = self.shards[self.shard_index(key)].read();
        match (guard.get(key), self.ttl()) {
            (Some(entry), Some(ttl)) => !entry.is_expired(ttl),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shards[self.shard_index(key)]
            .write()
            .remove(key)
            .map(|e| e.value)
    }

    /// Number of live entries. Shard read locks are taken together in
    /// index order, so the count is a consistent snapshot and never
    /// over-reports past `max_size` mid-eviction.
    pub fn len(&self) -> usize {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        guards.iter().map(|g| g.len()).sum()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries. Statistics are kept.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    /// Physically remove every expired entry. Returns how many were
    /// dropped. No-op under non-TTL policies.
    pub fn cleanup_expired(&self) -> usize {
        match self.ttl() {
            Some(ttl) => self.sweep_expired(ttl),
            None => 0,
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            current_size: self.len(),
            max_size: self.max_size,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        if matches!(self.policy, EvictionPolicy::Adaptive { .. }) {
            if hit {
                self.window_hits.fetch_add(1, Ordering::Relaxed);
            }
            let total = self.window_total.fetch_add(1, Ordering::Relaxed) + 1;
            if total >= ADAPTIVE_WINDOW {
                let hits = self.window_hits.swap(0, Ordering::Relaxed);
                self.window_total.store(0, Ordering::Relaxed);
                let mille = (hits * 1000 / total.max(1)) as usize;
                self.window_rate_mille.store(mille, Ordering::Relaxed);
            }
        }
    }

    fn sweep_expired(&self, ttl: Duration) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, entry| !entry.is_expired(ttl));
            removed += before - guard.len();
        }
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Pick and remove one victim per the active policy. Returns false if
    /// the cache was empty.
    fn evict_one(&self) -> bool {
        let use_lfu = match self.policy {
            EvictionPolicy::Lfu => true,
            EvictionPolicy::Adaptive { threshold } => {
                let rate = self.window_rate_mille.load(Ordering::Relaxed) as f64 / 1000.0;
                // Until a full window has been observed the blended rate
                // over all lookups stands in for the window rate.
                let hits = self.hits.load(Ordering::Relaxed);
                let misses = self.misses.load(Ordering::Relaxed);
                let effective = if hits + misses < ADAPTIVE_WINDOW {
                    if hits + misses == 0 {
                        1.0
                    } else {
                        hits as f64 / (hits + misses) as f64
                    }
                } else {
                    rate
                };
                effective >= threshold
            }
            _ => false,
        };
        let by_insert_age = matches!(self.policy, EvictionPolicy::Ttl(_));

        // Scan shard snapshots for the policy's victim.
        let mut victim: Option<(usize, K, Instant, u64, Instant)> = None;
        for (idx, shard) in self.shards.iter().enumerate() {
            let guard = shard.read();
            for (key, entry) in guard.iter() {
                let better = match &victim {
                    None => true,
                    Some((_, _, last, count, inserted)) => {
                        if by_insert_age {
                            entry.inserted_at < *inserted
                        } else if use_lfu {
                            entry.access_count < *count
                                || (entry.access_count == *count && entry.last_accessed < *last)
                        } else {
                            entry.last_accessed < *last
                        }
                    }
                };
                if better {
                    victim = Some((
                        idx,
                        key.clone(),
                        entry.last_accessed,
                        entry.access_count,
                        entry.inserted_at,
                    ));
                }
            }
        }

        match victim {
            Some((idx, key, ..)) => {
                if self.shards[idx].write().remove(&key).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }
}
