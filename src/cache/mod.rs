//! Cache Module
//!
//! Two-tier caching: a memory tier with TTL expiration, priority-aware LRU
//! eviction and optional gzip compression, written through to a durable
//! [`PersistentStore`](crate::persistent::PersistentStore).

mod codec;
mod entry;
mod eviction;
mod fingerprint;
mod invalidation;
mod service;
mod stats;
mod store;


// Re-export public types
pub use codec::{CompressionCodec, Encoded};
pub use entry::{current_timestamp_ms, CacheEntry, NewEntry, Priority, SetOptions};
pub use eviction::{EvictionPolicy, Victim};
pub use fingerprint::{fingerprint, fingerprint_key};
pub use invalidation::{like_to_regex, Invalidation, InvalidationIndex, KeyPattern};
pub use service::{EntryInfo, MaintenanceReport, TieredCache, WarmupReport};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{validate_key, CacheStore, InsertOutcome, Lookup, Payload};

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
