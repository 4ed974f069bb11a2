//! Query result cache: LRU/LFU eviction, TTL expiry, and mutation-triggered
//! invalidation (spec.md §4.10).

use crate::distance::DistanceMetric;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Eviction policy for [`ResultCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the least-recently-used entry (tail of the recency list).
    Lru,
    /// Evict the entry with the lowest `access_count`, ties broken by the
    /// oldest `created_at`.
    Lfu,
}

/// Cache statistics for monitoring, mirroring `cache/lru.rs`'s `CacheStats`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries removed for cause rather than capacity: TTL expiry on lookup
    /// and mutation-triggered full-cache flushes (spec.md §8's cache TTL
    /// scenario: "wait 2s, lookup -> miss, `stats.invalidations == 1`").
    pub invalidations: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Exact lookup key: the hash is used as the index key, but `dimension`,
/// `k`, `metric`, and the raw `query` bytes are retained for the
/// collision-verification comparison spec.md §4.9 requires.
#[derive(Clone)]
struct StoredKey {
    dimension: usize,
    k: usize,
    metric: DistanceMetric,
    query: Vec<f32>,
}

impl StoredKey {
    fn matches(&self, dimension: usize, k: usize, metric: DistanceMetric, query: &[f32]) -> bool {
        self.dimension == dimension && self.k == k && self.metric == metric && self.query == query
    }
}

/// A cached query result: a fresh `(ids, distances)` copy is handed back on
/// every hit so the caller owns it independently of the cache's storage.
#[derive(Clone)]
struct CacheEntry {
    ids: Vec<u64>,
    distances: Vec<f32>,
    created_at: Instant,
    access_count: u64,
    memory_size: usize,
}

impl CacheEntry {
    fn new(ids: Vec<u64>, distances: Vec<f32>, query_len: usize) -> Self {
        let memory_size = query_len * std::mem::size_of::<f32>()
            + ids.len() * std::mem::size_of::<u64>()
            + distances.len() * std::mem::size_of::<f32>();
        Self {
            ids,
            distances,
            created_at: Instant::now(),
            access_count: 0,
            memory_size,
        }
    }
}

struct Slot {
    key: StoredKey,
    entry: CacheEntry,
}

struct Inner {
    /// Insertion/recency order: front is least-recently-used. Keyed by the
    /// combined FNV-1a hash from spec.md §4.9.
    order: Vec<u64>,
    slots: HashMap<u64, Slot>,
    memory_bytes: usize,
    mutation_count: u64,
    stats: CacheStats,
}

/// LRU/LFU query result cache (spec.md §4.10).
///
/// All operations serialize through a single mutex, including statistics
/// updates, matching the invariant spec.md §4.10 states explicitly.
pub struct ResultCache {
    max_entries: usize,
    max_memory_bytes: usize,
    ttl: Option<Duration>,
    invalidate_after_mutations: u64,
    policy: EvictionPolicy,
    inner: Mutex<Inner>,
}

impl ResultCache {
    #[must_use]
    pub fn new(
        max_entries: usize,
        max_memory_bytes: usize,
        ttl_seconds: u64,
        invalidate_after_mutations: u64,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            max_entries,
            max_memory_bytes,
            ttl: (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds)),
            invalidate_after_mutations,
            policy,
            inner: Mutex::new(Inner {
                order: Vec::new(),
                slots: HashMap::new(),
                memory_bytes: 0,
                mutation_count: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Combined cache key per spec.md §4.9:
    /// `fnv1a(query) xor fnv1a(k) xor fnv1a(metric)`.
    fn combined_key(dimension: usize, k: usize, metric: DistanceMetric, query: &[f32]) -> u64 {
        let _ = dimension;
        let query_bytes: Vec<u8> = query.iter().flat_map(|f| f.to_be_bytes()).collect();
        fnv1a(&query_bytes) ^ fnv1a(&(k as u64).to_be_bytes()) ^ fnv1a(&[metric.wire_code()])
    }

    /// Looks up a cached result, returning a fresh copy on hit. Expired
    /// (TTL) entries are evicted in place and counted as a miss.
    #[must_use]
    pub fn get(&self, dimension: usize, k: usize, metric: DistanceMetric, query: &[f32]) -> Option<(Vec<u64>, Vec<f32>)> {
        let key = Self::combined_key(dimension, k, metric, query);
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.slots.get(&key) {
            if !slot.key.matches(dimension, k, metric, query) {
                inner.stats.misses += 1;
                return None;
            }
            if let Some(ttl) = self.ttl {
                if slot.entry.created_at.elapsed() > ttl {
                    Self::remove_key(&mut inner, key);
                    inner.stats.misses += 1;
                    inner.stats.invalidations += 1;
                    return None;
                }
            }
        } else {
            inner.stats.misses += 1;
            return None;
        }

        inner.stats.hits += 1;
        if self.policy == EvictionPolicy::Lru {
            inner.order.retain(|&k| k != key);
            inner.order.push(key);
        }
        let slot = inner.slots.get_mut(&key).expect("checked present above");
        slot.entry.access_count += 1;
        Some((slot.entry.ids.clone(), slot.entry.distances.clone()))
    }

    /// Stores a result, replacing any existing entry under the same key.
    /// Evicts under the configured policy until both `max_entries` and
    /// `max_memory_bytes` are satisfied.
    pub fn put(&self, dimension: usize, k: usize, metric: DistanceMetric, query: &[f32], ids: Vec<u64>, distances: Vec<f32>) {
        let key = Self::combined_key(dimension, k, metric, query);
        let entry = CacheEntry::new(ids, distances, query.len());
        let stored_key = StoredKey {
            dimension,
            k,
            metric,
            query: query.to_vec(),
        };

        let mut inner = self.inner.lock();
        if inner.slots.contains_key(&key) {
            Self::remove_key(&mut inner, key);
        }

        inner.memory_bytes += entry.memory_size;
        inner.slots.insert(key, Slot { key: stored_key, entry });
        inner.order.push(key);

        while (inner.slots.len() > self.max_entries || inner.memory_bytes > self.max_memory_bytes) && !inner.order.is_empty() {
            self.evict_one(&mut inner);
        }
    }

    fn evict_one(&self, inner: &mut Inner) {
        let victim = match self.policy {
            EvictionPolicy::Lru => inner.order.first().copied(),
            EvictionPolicy::Lfu => inner
                .slots
                .iter()
                .min_by(|a, b| {
                    a.1.entry
                        .access_count
                        .cmp(&b.1.entry.access_count)
                        .then_with(|| a.1.entry.created_at.cmp(&b.1.entry.created_at))
                })
                .map(|(k, _)| *k),
        };
        if let Some(victim) = victim {
            Self::remove_key(inner, victim);
            inner.stats.evictions += 1;
        }
    }

    fn remove_key(inner: &mut Inner, key: u64) {
        if let Some(slot) = inner.slots.remove(&key) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(slot.entry.memory_size);
        }
        inner.order.retain(|&k| k != key);
    }

    /// Records a mutation notification. Once `invalidate_after_mutations`
    /// notifications have accumulated, the entire cache is flushed and the
    /// counter reset (spec.md §4.10).
    pub fn notify_mutation(&self) {
        let mut inner = self.inner.lock();
        inner.mutation_count += 1;
        if self.invalidate_after_mutations > 0 && inner.mutation_count >= self.invalidate_after_mutations {
            inner.slots.clear();
            inner.order.clear();
            inner.memory_bytes = 0;
            inner.mutation_count = 0;
            inner.stats.invalidations += 1;
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.order.clear();
        inner.memory_bytes = 0;
    }
}

/// FNV-1a, matching the hash used by `point_id_map.rs` for a consistent
/// allocation-free hash family across the crate.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h
}
