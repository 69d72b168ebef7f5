//! Cache Statistics Module
//!
//! Tracks hits, misses, evictions, expirations and compression savings.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// == Cache Stats ==
/// Running counters, updated lock-free from any request handler.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    bytes_before_compression: AtomicU64,
    bytes_after_compression: AtomicU64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_hit(&self) {
        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records one compressed write: serialized size before and after gzip.
    pub fn record_compression(&self, before: usize, after: usize) {
        self.bytes_before_compression
            .fetch_add(before as u64, Ordering::Relaxed);
        self.bytes_after_compression
            .fetch_add(after as u64, Ordering::Relaxed);
    }

    // == Snapshot ==
    /// Freezes the counters together with the store's current occupancy.
    pub fn snapshot(&self, entries: usize, memory_usage: usize, max_memory: usize) -> StatsSnapshot {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let persistent_hits = self.persistent_hits.load(Ordering::Relaxed);
        let hits = memory_hits + persistent_hits;
        let misses = self.misses.load(Ordering::Relaxed);
        let before = self.bytes_before_compression.load(Ordering::Relaxed);
        let after = self.bytes_after_compression.load(Ordering::Relaxed);

        let (hit_rate, miss_rate) = match hits + misses {
            0 => (0.0, 0.0),
            total => (hits as f64 / total as f64, misses as f64 / total as f64),
        };

        StatsSnapshot {
            entries,
            memory_usage,
            max_memory,
            hits,
            misses,
            memory_hits,
            persistent_hits,
            hit_rate,
            miss_rate,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            compression_ratio: if after == 0 {
                1.0
            } else {
                before as f64 / after as f64
            },
        }
    }
}

/// Point-in-time view of cache health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Live memory-tier entries
    pub entries: usize,
    /// Bytes held by the memory tier
    pub memory_usage: usize,
    pub max_memory: usize,
    /// Reads served by either tier
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    /// Uncompressed over compressed bytes for compressed writes, 1.0 when none
    pub compression_ratio: f64,
}
