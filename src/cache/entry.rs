//! Cache Entry Module
//!
//! Defines individual memory-tier entries, their write options and TTL handling.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// == Priority ==
/// Eviction priority of an entry. `High` is the reserved eviction-exempt marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Parses the persisted form; unknown labels fall back to `Medium`.
    pub fn parse(label: &str) -> Self {
        match label {
            "low" => Priority::Low,
            "high" => Priority::High,
            _ => Priority::Medium,
        }
    }

    /// Whether the eviction policy may pick this entry in a normal scan.
    pub fn is_evictable(&self) -> bool {
        !matches!(self, Priority::High)
    }
}

// == Set Options ==
/// Per-write options. Unset fields fall back to the cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetOptions {
    /// TTL in seconds
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Labels for bulk invalidation
    #[serde(default)]
    pub tags: Vec<String>,
    /// Keys this entry derives from
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Force (true) or forbid (false) compression, None = auto above threshold
    #[serde(default)]
    pub compress: Option<bool>,
    /// Per-call override of the maximum entry size in bytes
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub priority: Priority,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = Some(secs);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// == New Entry ==
/// Everything the store needs to admit an entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub key: String,
    pub payload: Arc<[u8]>,
    pub compressed: bool,
    pub ttl_seconds: u64,
    pub tags: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub priority: Priority,
    /// Creation time (Unix milliseconds); repopulated entries keep their durable timestamp
    pub created_at: u64,
}

// == Cache Entry ==
/// A live memory-tier entry.
///
/// Access metadata is atomic so hits can be recorded under a shared lock.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    /// Stored bytes, gzip-compressed when `compressed` is set
    pub payload: Arc<[u8]>,
    pub compressed: bool,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    pub ttl_seconds: u64,
    pub size_bytes: usize,
    pub tags: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub priority: Priority,
    pub version: u64,
    last_accessed_at: AtomicU64,
    access_tick: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    // == Constructor ==
    /// Builds a live entry from an admitted write.
    ///
    /// # Arguments
    /// * `new` - The admitted write
    /// * `version` - Store-wide monotonic write counter value
    /// * `now` - Current Unix time in milliseconds
    /// * `tick` - Store-wide access tick, breaks LRU ties within one millisecond
    pub fn new(new: NewEntry, version: u64, now: u64, tick: u64) -> Self {
        let size_bytes = new.payload.len();
        Self {
            key: new.key,
            payload: new.payload,
            compressed: new.compressed,
            created_at: new.created_at,
            ttl_seconds: new.ttl_seconds,
            size_bytes,
            tags: new.tags,
            dependencies: new.dependencies,
            priority: new.priority,
            version,
            last_accessed_at: AtomicU64::new(now),
            access_tick: AtomicU64::new(tick),
            access_count: AtomicU64::new(0),
        }
    }

    // == Is Expired ==
    /// Checks whether the entry is stale at `now`.
    ///
    /// Boundary condition: the entry is expired once `now - created_at >= ttl`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) >= self.ttl_seconds.saturating_mul(1000)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Returns remaining TTL in seconds, 0 once expired.
    pub fn ttl_remaining(&self, now: u64) -> u64 {
        let expires = self
            .created_at
            .saturating_add(self.ttl_seconds.saturating_mul(1000));
        expires.saturating_sub(now) / 1000
    }

    // == Touch ==
    /// Records a successful read.
    pub fn touch(&self, now: u64, tick: u64) {
        self.last_accessed_at.fetch_max(now, Ordering::Relaxed);
        self.access_tick.fetch_max(tick, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_accessed_at(&self) -> u64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// LRU ordering key: smaller means less recently used.
    pub fn recency(&self) -> (u64, u64) {
        (
            self.last_accessed_at.load(Ordering::Relaxed),
            self.access_tick.load(Ordering::Relaxed),
        )
    }

    /// Options that reproduce this entry on rewrite.
    pub fn options(&self) -> SetOptions {
        SetOptions {
            ttl: Some(self.ttl_seconds),
            tags: self.tags.iter().cloned().collect(),
            dependencies: self.dependencies.iter().cloned().collect(),
            compress: None,
            max_size: None,
            priority: self.priority,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
