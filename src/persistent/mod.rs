//! Persistent Store Module
//!
//! The durable tier behind the memory cache. The cache treats it as
//! authoritative on a local miss and writes through to it on every `set`.
//!
//! # Adapters
//! - [`MemoryPersistentStore`]: process-local map with fault injection, for tests
//! - [`SqliteStore`]: SQLite table (feature `sqlite`)

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Priority;
use crate::error::Result;

pub use memory::MemoryPersistentStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

// == Persistent Record ==
/// Durable copy of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentRecord {
    pub key: String,
    /// Serialized value, gzip-compressed when `compressed` is set
    pub value: Vec<u8>,
    pub compressed: bool,
    /// TTL in seconds
    pub ttl: u64,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub priority: Priority,
    /// Stored size in bytes
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistentRecord {
    /// Creation time in Unix milliseconds.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at.timestamp_millis().max(0) as u64
    }

    /// Stale once `now - created_at >= ttl`, same rule as the memory tier.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms()) >= self.ttl.saturating_mul(1000)
    }
}

/// Converts Unix milliseconds to a UTC timestamp.
pub fn timestamp_from_ms(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
}

// == Persistent Store Trait ==
/// Durable key/value table contract.
///
/// Implementations must be thread-safe; the cache calls them concurrently and
/// outside its own locks, bounded by a timeout.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get_by_key(&self, key: &str) -> Result<Option<PersistentRecord>>;

    /// Inserts or replaces the record for `record.key`.
    async fn upsert(&self, record: PersistentRecord) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete_by_key(&self, key: &str) -> Result<bool>;

    /// Deletes records created before `older_than`, returning how many.
    async fn delete_where(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Keys of records whose tag list contains `tag`.
    async fn query_by_tag_contains(&self, tag: &str) -> Result<Vec<String>>;

    /// Keys matching a SQL `LIKE` pattern with `\` as escape character.
    async fn query_by_key_like(&self, pattern: &str) -> Result<Vec<String>>;

    /// Keys of records whose dependency list contains `key`.
    async fn query_by_dependency_contains(&self, key: &str) -> Result<Vec<String>>;
}
