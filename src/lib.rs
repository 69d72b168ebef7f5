//! Tiercache - a two-tier caching engine
//!
//! A memory tier with TTL expiration, priority-aware LRU eviction and gzip
//! compression, written through to a durable store, with tag, pattern and
//! dependency-graph invalidation.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod persistent;
pub mod tasks;

pub use api::{create_router, AppState};
pub use cache::{Invalidation, Priority, SetOptions, StatsSnapshot, TieredCache};
pub use config::{CacheConfig, Config};
pub use error::{CacheError, Result};
pub use persistent::{MemoryPersistentStore, PersistentRecord, PersistentStore};
#[cfg(feature = "sqlite")]
pub use persistent::SqliteStore;
pub use tasks::spawn_maintenance_task;
