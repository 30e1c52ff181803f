//! # Multi-Level Cache Module
//!
//! A three-level in-memory read cache sitting in front of the storage
//! engine:
//!
//! | Level | Policy | Intended role                                  |
//! |-------|--------|------------------------------------------------|
//! | L1    | LRU    | Small, hot working set (fresh writes and reads)|
//! | L2    | LRU    | Larger recency pool fed by L1 overflow         |
//! | L3    | LFU    | Small frequency-protected set fed by L2 overflow|
//!
//! Entries move in both directions. A hit below L1 **promotes** the
//! entry one level up and removes it from the level it was found in, so
//! any key lives in at most one level. An insert that overflows a
//! level's capacity **demotes** the evicted victim one level down
//! instead of dropping it: entries fall L1 → L2 → L3 and leave the
//! cache only when L3 evicts them. A write that re-targets a key
//! already resident in L3 counts as an access and raises its frequency;
//! demotion arrivals start at zero.
//! Per-level hit/miss counters feed [`MultiLevelCache::stats`].
//!
//! The cache stores the engine's raw (post-codec) bytes; it is a pure
//! performance layer and must stay transparent — evicting or clearing it
//! can never change a read's result, only its latency.
//!
//! All operations take one short mutex critical section and never block
//! on I/O.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Mutex,
};

use lru::LruCache;
use regex::bytes::Regex;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Which cache level an insert targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    /// Hot LRU level.
    L1,
    /// Warm LRU level.
    L2,
    /// Frequency-protected LFU level.
    L3,
}

/// An entry in the LFU level.
#[derive(Debug, Clone)]
struct LfuEntry {
    bytes: Vec<u8>,

    /// Accesses accrued while resident: writes re-targeting this key.
    /// Read hits promote the entry out of the level instead.
    freq: u64,

    /// Insertion tick, breaking frequency ties in favour of older entries.
    inserted_at: u64,
}

/// Per-level hit/miss counters plus totals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub entries: usize,
    pub bytes: usize,
    /// Overall hit ratio across all levels; 0.0 before any lookup.
    pub hit_ratio: f64,
}

struct CacheInner {
    l1: LruCache<Vec<u8>, Vec<u8>>,
    l2: LruCache<Vec<u8>, Vec<u8>>,
    l3: HashMap<Vec<u8>, LfuEntry>,
    l3_capacity: usize,

    /// Monotonic insertion tick for LFU tie-breaks.
    tick: u64,

    l1_hits: u64,
    l1_misses: u64,
    l2_hits: u64,
    l2_misses: u64,
    l3_hits: u64,
    l3_misses: u64,
}

/// Three-level read cache with promotion-on-hit and
/// demotion-on-overflow.
pub struct MultiLevelCache {
    inner: Mutex<CacheInner>,
}

impl MultiLevelCache {
    /// Creates a cache with the given per-level entry capacities.
    ///
    /// Capacities must be non-zero; the facade validates its configuration
    /// before construction.
    pub fn new(l1_capacity: NonZeroUsize, l2_capacity: NonZeroUsize, l3_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                l1: LruCache::new(l1_capacity),
                l2: LruCache::new(l2_capacity),
                l3: HashMap::new(),
                l3_capacity: l3_capacity.get(),
                tick: 0,
                l1_hits: 0,
                l1_misses: 0,
                l2_hits: 0,
                l2_misses: 0,
                l3_hits: 0,
                l3_misses: 0,
            }),
        }
    }

    /// Inserts `bytes` for `key` at the given level, removing the key from
    /// every other level so it lives in exactly one place. Overflow
    /// victims demote one level down rather than leaving the cache.
    pub fn put(&self, key: &[u8], bytes: Vec<u8>, level: CacheLevel) {
        let mut inner = self.lock();
        match level {
            CacheLevel::L1 => {
                inner.l2.pop(key);
                inner.l3.remove(key);
                inner.insert_l1(key.to_vec(), bytes);
            }
            CacheLevel::L2 => {
                inner.l1.pop(key);
                inner.l3.remove(key);
                inner.insert_l2(key.to_vec(), bytes);
            }
            CacheLevel::L3 => {
                inner.l1.pop(key);
                inner.l2.pop(key);
                inner.insert_l3(key.to_vec(), bytes);
            }
        }
        trace!(key_len = key.len(), level = ?level, "cache insert");
    }

    /// Looks up a key, checking L1 → L2 → L3.
    ///
    /// A hit in L2 or L3 promotes the entry one level up (and removes it
    /// from the level it was found in).
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.lock();

        if let Some(bytes) = inner.l1.get(key) {
            let bytes = bytes.clone();
            inner.l1_hits += 1;
            return Some(bytes);
        }
        inner.l1_misses += 1;

        if let Some(bytes) = inner.l2.pop(key) {
            inner.l2_hits += 1;
            inner.insert_l1(key.to_vec(), bytes.clone());
            return Some(bytes);
        }
        inner.l2_misses += 1;

        if let Some(entry) = inner.l3.remove(key) {
            inner.l3_hits += 1;
            inner.insert_l2(key.to_vec(), entry.bytes.clone());
            return Some(entry.bytes);
        }
        inner.l3_misses += 1;

        None
    }

    /// Removes a key from every level.
    pub fn remove(&self, key: &[u8]) {
        let mut inner = self.lock();
        inner.evict_everywhere(key);
    }

    /// Removes every key matching `pattern` from every level.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.lock();

        let l1_victims: Vec<Vec<u8>> = inner
            .l1
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        let l2_victims: Vec<Vec<u8>> = inner
            .l2
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        let l3_victims: Vec<Vec<u8>> = inner
            .l3
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();

        let mut removed = 0;
        for key in &l1_victims {
            if inner.l1.pop(key).is_some() {
                removed += 1;
            }
        }
        for key in &l2_victims {
            if inner.l2.pop(key).is_some() {
                removed += 1;
            }
        }
        for key in &l3_victims {
            if inner.l3.remove(key).is_some() {
                removed += 1;
            }
        }

        debug!(pattern = %pattern, removed, "cache pattern invalidation");
        removed
    }

    /// Drops every entry from every level. Counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.l1.clear();
        inner.l2.clear();
        inner.l3.clear();
    }

    /// Total entries across all levels.
    pub fn total_entries(&self) -> usize {
        let inner = self.lock();
        inner.l1.len() + inner.l2.len() + inner.l3.len()
    }

    /// Total cached bytes (keys excluded) across all levels.
    pub fn total_bytes(&self) -> usize {
        let inner = self.lock();
        inner.l1.iter().map(|(_, v)| v.len()).sum::<usize>()
            + inner.l2.iter().map(|(_, v)| v.len()).sum::<usize>()
            + inner.l3.values().map(|e| e.bytes.len()).sum::<usize>()
    }

    /// Snapshot of per-level counters and totals.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let hits = inner.l1_hits + inner.l2_hits + inner.l3_hits;
        // Each lookup misses every level above the one that hit, so the
        // denominator counts lookups, not per-level probes.
        let lookups = hits + inner.l3_misses;
        CacheStats {
            l1_hits: inner.l1_hits,
            l1_misses: inner.l1_misses,
            l2_hits: inner.l2_hits,
            l2_misses: inner.l2_misses,
            l3_hits: inner.l3_hits,
            l3_misses: inner.l3_misses,
            entries: inner.l1.len() + inner.l2.len() + inner.l3.len(),
            bytes: inner.l1.iter().map(|(_, v)| v.len()).sum::<usize>()
                + inner.l2.iter().map(|(_, v)| v.len()).sum::<usize>()
                + inner.l3.values().map(|e| e.bytes.len()).sum::<usize>(),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // A panicked holder leaves no partial state worth rejecting.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CacheInner {
    fn evict_everywhere(&mut self, key: &[u8]) {
        self.l1.pop(key);
        self.l2.pop(key);
        self.l3.remove(key);
    }

    /// Inserts into L1; a capacity-evicted victim demotes into L2.
    ///
    /// `push` also reports a same-key overwrite as its return value, so
    /// the victim is demoted only when it is a different key.
    fn insert_l1(&mut self, key: Vec<u8>, bytes: Vec<u8>) {
        if let Some((victim_key, victim_bytes)) = self.l1.push(key.clone(), bytes)
            && victim_key != key
        {
            self.insert_l2(victim_key, victim_bytes);
        }
    }

    /// Inserts into L2; a capacity-evicted victim demotes into L3.
    fn insert_l2(&mut self, key: Vec<u8>, bytes: Vec<u8>) {
        if let Some((victim_key, victim_bytes)) = self.l2.push(key.clone(), bytes)
            && victim_key != key
        {
            self.insert_l3(victim_key, victim_bytes);
        }
    }

    /// Inserts into the LFU level.
    ///
    /// A write to a key already resident here is an access: it replaces
    /// the bytes and raises the frequency. New arrivals start at zero
    /// and, when the level is full, evict the lowest-frequency entry
    /// (oldest insertion on ties).
    fn insert_l3(&mut self, key: Vec<u8>, bytes: Vec<u8>) {
        if let Some(entry) = self.l3.get_mut(&key) {
            entry.bytes = bytes;
            entry.freq += 1;
            return;
        }
        if self.l3.len() >= self.l3_capacity {
            let victim = self
                .l3
                .iter()
                .min_by_key(|(_, e)| (e.freq, e.inserted_at))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                self.l3.remove(&victim);
            }
        }
        let tick = self.tick;
        self.tick += 1;
        self.l3.insert(
            key,
            LfuEntry {
                bytes,
                freq: 0,
                inserted_at: tick,
            },
        );
    }
}
