//! Configuration Module
//!
//! Handles loading and managing cache and server configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tuning for the tiered cache engine.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory-tier budget in bytes
    pub max_memory_bytes: usize,
    /// Default TTL in seconds for entries without explicit TTL
    pub default_ttl: u64,
    /// Payloads larger than this are compressed automatically
    pub compression_threshold: usize,
    /// Largest single entry accepted unless a `max_size` override is given
    pub max_entry_size: usize,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
    /// Interval between statistics reports
    pub stats_interval: Duration,
    /// Upper bound on every durable-tier call
    pub store_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * 1024 * 1024,
            default_ttl: 3600,
            compression_threshold: 1024,
            max_entry_size: 1024 * 1024,
            sweep_interval: Duration::from_secs(300),
            stats_interval: Duration::from_secs(3600),
            store_timeout: Duration::from_millis(2000),
        }
    }
}

impl CacheConfig {
    /// Sets the memory budget.
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Sets the default TTL in seconds.
    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl = secs;
        self
    }

    /// Sets the automatic compression threshold.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Sets the durable-tier call timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the maintenance intervals.
    pub fn with_intervals(mut self, sweep: Duration, stats: Duration) -> Self {
        self.sweep_interval = sweep;
        self.stats_interval = stats;
        self
    }
}

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cache engine tuning
    pub cache: CacheConfig,
    /// SQLite database file for the durable tier, None = in-process store
    pub database_path: Option<String>,
    /// HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_MEMORY_BYTES` - Memory budget (default: 100 MB)
    /// - `DEFAULT_TTL` - Default TTL in seconds, must be positive (default: 3600)
    /// - `COMPRESSION_THRESHOLD` - Auto-compression threshold in bytes (default: 1024)
    /// - `MAX_ENTRY_SIZE` - Largest accepted entry in bytes (default: 1 MB)
    /// - `SWEEP_INTERVAL` - Expiry sweep frequency in seconds (default: 300)
    /// - `STATS_INTERVAL` - Statistics report frequency in seconds (default: 3600)
    /// - `STORE_TIMEOUT_MS` - Durable-tier call timeout (default: 2000)
    /// - `DATABASE_PATH` - SQLite file for the durable tier (default: unset)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    pub fn from_env() -> Self {
        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            max_memory_bytes: parse_var("MAX_MEMORY_BYTES").unwrap_or(defaults.max_memory_bytes),
            default_ttl: parse_var("DEFAULT_TTL")
                .filter(|ttl: &u64| *ttl > 0)
                .unwrap_or(defaults.default_ttl),
            compression_threshold: parse_var("COMPRESSION_THRESHOLD")
                .unwrap_or(defaults.compression_threshold),
            max_entry_size: parse_var("MAX_ENTRY_SIZE").unwrap_or(defaults.max_entry_size),
            sweep_interval: parse_var("SWEEP_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            stats_interval: parse_var("STATS_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_interval),
            store_timeout: parse_var("STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
        };

        Self {
            cache,
            database_path: env::var("DATABASE_PATH").ok().filter(|p| !p.is_empty()),
            server_port: parse_var("SERVER_PORT").unwrap_or(3000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            database_path: None,
            server_port: 3000,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
