//! Tiered Cache Service
//!
//! The public cache API: a memory tier ([`CacheStore`]) in front of a durable
//! [`PersistentStore`], with write-through, fail-open reads, tag/pattern/
//! dependency invalidation and an explicitly managed maintenance task.
//!
//! # Locking
//! The memory tier sits behind one `RwLock`. Hits take the shared lock;
//! every mutation of entries, indices or size accounting (including
//! eviction) takes the exclusive lock. Durable-tier calls are made with no
//! lock held and are bounded by `store_timeout`.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    current_timestamp_ms, validate_key, CacheStats, CacheStore, CompressionCodec, InsertOutcome,
    Invalidation, KeyPattern, Lookup, NewEntry, Payload, Priority, SetOptions, StatsSnapshot,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::persistent::{timestamp_from_ms, MemoryPersistentStore, PersistentRecord, PersistentStore};
use crate::tasks::spawn_maintenance_task;

/// Outcome of a [`TieredCache::warmup`] batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupReport {
    /// Fetched and stored
    pub loaded: usize,
    /// Already cached in either tier
    pub skipped: usize,
    /// Fetcher had no value
    pub missing: usize,
    /// Fetch or store failed
    pub failed: usize,
}

/// Outcome of one maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Expired memory-tier entries removed
    pub expired: usize,
    /// Durable records purged, None if the durable purge failed
    pub persistent_purged: Option<u64>,
}

/// Memory-tier metadata for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub key: String,
    pub size_bytes: usize,
    pub compressed: bool,
    pub version: u64,
    pub access_count: u64,
    pub created_at: u64,
    pub last_accessed_at: u64,
    pub ttl_seconds: u64,
    pub ttl_remaining: u64,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub priority: Priority,
}

struct Lifecycle {
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

// == Tiered Cache ==
/// Two-tier cache service. Construct once and share by cloning; clones use
/// the same tiers, statistics and maintenance task.
#[derive(Clone)]
pub struct TieredCache {
    store: Arc<RwLock<CacheStore>>,
    persistent: Arc<dyn PersistentStore>,
    codec: CompressionCodec,
    stats: Arc<CacheStats>,
    config: Arc<CacheConfig>,
    lifecycle: Arc<Lifecycle>,
}

impl TieredCache {
    // == Constructors ==
    pub fn new(config: CacheConfig, persistent: Arc<dyn PersistentStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store: Arc::new(RwLock::new(CacheStore::new(config.max_memory_bytes))),
            persistent,
            codec: CompressionCodec::new(config.compression_threshold),
            stats: Arc::new(CacheStats::new()),
            config: Arc::new(config),
            lifecycle: Arc::new(Lifecycle {
                shutdown,
                maintenance: Mutex::new(None),
            }),
        }
    }

    /// Cache backed by an in-process durable tier.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(MemoryPersistentStore::new()))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn persistent(&self) -> &Arc<dyn PersistentStore> {
        &self.persistent
    }

    /// Runs a durable-tier call with the configured timeout.
    async fn durable<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(format!(
                "persistent store {} exceeded {:?}",
                op, self.config.store_timeout
            ))),
        }
    }

    fn note_evictions(&self, outcome: &InsertOutcome) {
        if !outcome.evicted.is_empty() {
            self.stats.record_evictions(outcome.evicted.len());
            debug!(evicted = ?outcome.evicted, "Evicted entries to fit memory budget");
        }
    }

    // == Get ==
    /// Returns the value for `key`, or None on a miss in both tiers.
    ///
    /// Durable-tier failures and timeouts are logged and count as misses.
    /// Errors with [`CacheError::Corrupted`] only when a found payload cannot
    /// be decoded as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.fetch(key).await {
            Some(payload) => self
                .codec
                .decode(&payload.bytes, payload.compressed)
                .map(Some)
                .map_err(|e| {
                    warn!(key = %key, error = %e, "Stored payload failed to decode");
                    CacheError::Corrupted(format!("payload for '{}': {}", key, e))
                }),
            None => Ok(None),
        }
    }

    async fn fetch(&self, key: &str) -> Option<Payload> {
        let now = current_timestamp_ms();

        let (lookup, generation) = {
            let store = self.store.read().await;
            (store.lookup(key, now), store.generation())
        };
        match lookup {
            Lookup::Hit(payload) => {
                self.stats.record_memory_hit();
                return Some(payload);
            }
            Lookup::Expired => {
                if self.store.write().await.remove_if_expired(key, now) {
                    self.stats.record_expirations(1);
                    debug!(key = %key, "Entry expired on read");
                }
            }
            Lookup::Missing => {}
        }

        let payload = self.load_from_persistent(key, now, generation).await;
        if payload.is_none() {
            self.stats.record_miss();
        }
        payload
    }

    /// `generation` is the memory tier's invalidation generation seen before
    /// the durable read; the copy is only cached if it is still current.
    async fn load_from_persistent(
        &self,
        key: &str,
        now: u64,
        generation: u64,
    ) -> Option<Payload> {
        let record = match self
            .durable("get_by_key", self.persistent.get_by_key(key))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Durable read failed, treating as miss");
                return None;
            }
        };

        if record.is_expired_at(now) {
            if let Err(e) = self
                .durable("delete_by_key", self.persistent.delete_by_key(key))
                .await
            {
                warn!(key = %key, error = %e, "Failed to delete expired durable record");
            }
            debug!(key = %key, "Durable copy expired");
            return None;
        }

        let created_at = record.created_at_ms();
        let payload = Payload {
            bytes: Arc::from(record.value),
            compressed: record.compressed,
        };
        let entry = NewEntry {
            key: key.to_string(),
            payload: Arc::clone(&payload.bytes),
            compressed: record.compressed,
            ttl_seconds: record.ttl,
            tags: record.tags.into_iter().collect(),
            dependencies: record.dependencies.into_iter().collect(),
            priority: record.priority,
            created_at,
        };

        let populated = self.store.write().await.populate(entry, now, generation);
        match populated {
            Ok(Some(outcome)) => self.note_evictions(&outcome),
            Ok(None) => debug!(key = %key, "Durable hit superseded, not repopulated"),
            Err(e) => debug!(key = %key, error = %e, "Durable hit not repopulated"),
        }

        self.stats.record_persistent_hit();
        debug!(key = %key, "Served from durable tier");
        Some(payload)
    }

    // == Set ==
    /// Stores `value` in memory (evicting as needed), then writes it through
    /// to the durable tier.
    ///
    /// If the durable write fails the memory write is rolled back, unless a
    /// newer write to the same key has already replaced it, and the error is
    /// returned.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<()> {
        validate_key(key)?;

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        if ttl == 0 {
            return Err(CacheError::InvalidRequest(
                "TTL must be at least one second".to_string(),
            ));
        }

        let encoded = self.codec.encode(value, options.compress)?;
        let limit = options.max_size.unwrap_or(self.config.max_entry_size);
        if encoded.bytes.len() > limit {
            return Err(CacheError::InvalidRequest(format!(
                "Value of {} bytes exceeds maximum entry size of {} bytes",
                encoded.bytes.len(),
                limit
            )));
        }
        if encoded.compressed {
            self.stats
                .record_compression(encoded.original_size, encoded.bytes.len());
        }

        let now = current_timestamp_ms();
        let stamp = timestamp_from_ms(now);
        let tags: BTreeSet<String> = options.tags.into_iter().collect();
        let dependencies: BTreeSet<String> = options.dependencies.into_iter().collect();
        let payload: Arc<[u8]> = Arc::from(encoded.bytes);

        let record = PersistentRecord {
            key: key.to_string(),
            value: payload.to_vec(),
            compressed: encoded.compressed,
            ttl,
            tags: tags.iter().cloned().collect(),
            dependencies: dependencies.iter().cloned().collect(),
            priority: options.priority,
            size: payload.len(),
            created_at: stamp,
            updated_at: stamp,
        };

        let outcome = self.store.write().await.insert(
            NewEntry {
                key: key.to_string(),
                payload,
                compressed: encoded.compressed,
                ttl_seconds: ttl,
                tags,
                dependencies,
                priority: options.priority,
                created_at: now,
            },
            now,
        )?;
        self.note_evictions(&outcome);

        if let Err(e) = self.durable("upsert", self.persistent.upsert(record)).await {
            let rolled_back = self
                .store
                .write()
                .await
                .remove_if_version(key, outcome.version);
            warn!(key = %key, error = %e, rolled_back, "Durable write failed");
            return Err(e);
        }

        debug!(key = %key, version = outcome.version, "Stored entry");
        Ok(())
    }

    // == Update ==
    /// Read-modify-write. Reuses the live entry's ttl, tags, dependencies and
    /// priority; `fallback` applies when the key is not cached.
    ///
    /// Not atomic: a concurrent writer between the read and the write is
    /// overwritten.
    pub async fn update<T, F>(&self, key: &str, f: F, fallback: SetOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let current = self.get::<T>(key).await?;
        let options = self
            .store
            .read()
            .await
            .entry(key)
            .map(|entry| entry.options())
            .unwrap_or(fallback);

        let next = f(current);
        self.set(key, &next, options).await?;
        Ok(next)
    }

    // == Delete ==
    /// Removes `key` from both tiers. Returns whether either tier held it.
    ///
    /// A durable failure is logged and the memory removal still stands.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let keys = HashSet::from([key.to_string()]);
        Ok(self.purge(&keys).await > 0)
    }

    // == Invalidate ==
    /// Resolves `criterion` to a key set across both tiers, then deletes every
    /// key from both. Returns the number of distinct keys removed.
    ///
    /// Durable-tier failures are logged and skipped; the memory tier is always
    /// invalidated.
    pub async fn invalidate(&self, criterion: Invalidation) -> Result<usize> {
        let keys = self.resolve(&criterion).await?;
        let removed = self.purge(&keys).await;

        self.stats.record_invalidations(removed);
        info!(criterion = ?criterion, resolved = keys.len(), removed, "Invalidated entries");
        Ok(removed)
    }

    /// Key set matched by `criterion`, without deleting anything.
    pub async fn resolve(&self, criterion: &Invalidation) -> Result<HashSet<String>> {
        match criterion {
            Invalidation::Tag(tag) => {
                let mut keys: HashSet<String> =
                    self.store.read().await.keys_for_tag(tag).into_iter().collect();
                match self
                    .durable("query_by_tag_contains", self.persistent.query_by_tag_contains(tag))
                    .await
                {
                    Ok(found) => keys.extend(found),
                    Err(e) => warn!(tag = %tag, error = %e, "Durable tag lookup failed"),
                }
                Ok(keys)
            }
            Invalidation::Pattern(glob) => {
                let pattern = KeyPattern::parse(glob)?;
                let mut keys: HashSet<String> = self
                    .store
                    .read()
                    .await
                    .keys_matching(&pattern)
                    .into_iter()
                    .collect();
                let like = pattern.to_like();
                match self
                    .durable("query_by_key_like", self.persistent.query_by_key_like(&like))
                    .await
                {
                    Ok(found) => keys.extend(found),
                    Err(e) => warn!(pattern = %glob, error = %e, "Durable pattern lookup failed"),
                }
                Ok(keys)
            }
            Invalidation::Dependencies(roots) => Ok(self.cascade(roots).await),
        }
    }

    /// Closure over dependents in both tiers, roots included.
    ///
    /// Each round expands the frontier through the memory-tier graph under one
    /// shared lock, then asks the durable tier for dependents of every newly
    /// reached key. Only unvisited keys re-enter the frontier, so cycles
    /// terminate.
    async fn cascade(&self, roots: &[String]) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut frontier: Vec<String> = roots.to_vec();

        while !frontier.is_empty() {
            let local = self
                .store
                .read()
                .await
                .index()
                .cascade(std::mem::take(&mut frontier));
            let fresh: Vec<String> = local
                .into_iter()
                .filter(|key| visited.insert(key.clone()))
                .collect();

            for key in &fresh {
                match self
                    .durable(
                        "query_by_dependency_contains",
                        self.persistent.query_by_dependency_contains(key),
                    )
                    .await
                {
                    Ok(found) => {
                        frontier.extend(found.into_iter().filter(|k| !visited.contains(k)))
                    }
                    Err(e) => warn!(key = %key, error = %e, "Durable dependency lookup failed"),
                }
            }
        }

        visited
    }

    /// Deletes `keys` from both tiers, returning how many either tier held.
    ///
    /// The memory tier is invalidated before and after the durable deletes.
    /// A `get` whose durable read overlapped the deletes either sees the
    /// generation change and skips repopulating, or repopulated before the
    /// second pass and is removed by it.
    async fn purge(&self, keys: &HashSet<String>) -> usize {
        let mut removed: HashSet<String> =
            self.store.write().await.invalidate(keys).into_iter().collect();

        for key in keys {
            match self
                .durable("delete_by_key", self.persistent.delete_by_key(key))
                .await
            {
                Ok(true) => {
                    removed.insert(key.clone());
                }
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Durable delete failed"),
            }
        }

        removed.extend(self.store.write().await.invalidate(keys));
        removed.len()
    }

    // == Warmup ==
    /// Fetches and stores every key not already cached in either tier.
    ///
    /// Failures are counted per key and never abort the batch.
    pub async fn warmup<T, F, Fut>(
        &self,
        keys: &[String],
        options: SetOptions,
        fetcher: F,
    ) -> WarmupReport
    where
        T: Serialize,
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let mut report = WarmupReport::default();

        for key in keys {
            if self.is_cached(key).await {
                report.skipped += 1;
                continue;
            }

            match fetcher(key.clone()).await {
                Ok(Some(value)) => match self.set(key, &value, options.clone()).await {
                    Ok(()) => report.loaded += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Warmup store failed");
                        report.failed += 1;
                    }
                },
                Ok(None) => report.missing += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Warmup fetch failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            missing = report.missing,
            failed = report.failed,
            "Warmup finished"
        );
        report
    }

    /// Live in either tier, without counting as a read.
    async fn is_cached(&self, key: &str) -> bool {
        let now = current_timestamp_ms();
        if self.store.read().await.contains_live(key, now) {
            return true;
        }
        matches!(
            self.durable("get_by_key", self.persistent.get_by_key(key)).await,
            Ok(Some(record)) if !record.is_expired_at(now)
        )
    }

    // == Introspection ==
    pub async fn stats(&self) -> StatsSnapshot {
        let store = self.store.read().await;
        self.stats
            .snapshot(store.len(), store.memory_usage(), store.max_memory())
    }

    /// Logs and returns the current statistics.
    pub async fn report_stats(&self) -> StatsSnapshot {
        let snapshot = self.stats().await;
        info!(
            entries = snapshot.entries,
            memory_usage = snapshot.memory_usage,
            hit_rate = snapshot.hit_rate,
            miss_rate = snapshot.miss_rate,
            evictions = snapshot.evictions,
            compression_ratio = snapshot.compression_ratio,
            "Cache statistics"
        );
        snapshot
    }

    /// Memory-tier metadata for `key`; does not count as an access.
    pub async fn inspect(&self, key: &str) -> Option<EntryInfo> {
        let now = current_timestamp_ms();
        let store = self.store.read().await;
        let entry = store.entry(key).filter(|e| !e.is_expired_at(now))?;
        Some(EntryInfo {
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
            compressed: entry.compressed,
            version: entry.version,
            access_count: entry.access_count(),
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at(),
            ttl_seconds: entry.ttl_seconds,
            ttl_remaining: entry.ttl_remaining(now),
            tags: entry.tags.iter().cloned().collect(),
            dependencies: entry.dependencies.iter().cloned().collect(),
            priority: entry.priority,
        })
    }

    /// Whether the memory tier holds a live entry for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.store
            .read()
            .await
            .contains_live(key, current_timestamp_ms())
    }

    /// Number of memory-tier entries.
    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }

    // == Maintenance ==
    /// One sweep: purge expired memory entries and durable records older than
    /// the default TTL.
    ///
    /// Snapshots expired keys under the shared lock, then removes them one
    /// exclusive lock at a time, re-checking expiry.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let now = current_timestamp_ms();
        let candidates = self.store.read().await.expired_keys(now);

        let mut expired = 0;
        for key in &candidates {
            if self.store.write().await.remove_if_expired(key, now) {
                expired += 1;
            }
        }
        self.stats.record_expirations(expired);

        let cutoff = timestamp_from_ms(
            now.saturating_sub(self.config.default_ttl.saturating_mul(1000)),
        );
        let persistent_purged = match self
            .durable("delete_where", self.persistent.delete_where(cutoff))
            .await
        {
            Ok(purged) => Some(purged),
            Err(e) => {
                warn!(error = %e, "Durable purge failed");
                None
            }
        };

        MaintenanceReport {
            expired,
            persistent_purged,
        }
    }

    /// Starts the background maintenance task. Returns false if it is already
    /// running or the cache has been closed.
    pub async fn start_maintenance(&self) -> bool {
        let mut slot = self.lifecycle.maintenance.lock().await;
        if slot.is_some() || *self.lifecycle.shutdown.borrow() {
            return false;
        }

        *slot = Some(spawn_maintenance_task(
            self.clone(),
            self.config.sweep_interval,
            self.config.stats_interval,
            self.lifecycle.shutdown.subscribe(),
        ));
        true
    }

    /// Stops the maintenance task and waits for it to finish. Idempotent.
    ///
    /// Reads and writes keep working afterwards; writes are synchronous so
    /// nothing is left to flush.
    pub async fn close(&self) {
        self.lifecycle.shutdown.send_replace(true);

        let handle = self.lifecycle.maintenance.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
            info!("Maintenance task stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.lifecycle.shutdown.borrow()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};

    /// Durable tier whose reads stall after fetching, so the answer can be
    /// outdated by the time the caller sees it.
    struct LaggingReads {
        inner: Arc<MemoryPersistentStore>,
        lag: Duration,
    }

    #[async_trait]
    impl PersistentStore for LaggingReads {
        async fn get_by_key(&self, key: &str) -> Result<Option<PersistentRecord>> {
            let record = self.inner.get_by_key(key).await;
            tokio::time::sleep(self.lag).await;
            record
        }

        async fn upsert(&self, record: PersistentRecord) -> Result<()> {
            self.inner.upsert(record).await
        }

        async fn delete_by_key(&self, key: &str) -> Result<bool> {
            self.inner.delete_by_key(key).await
        }

        async fn delete_where(&self, older_than: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_where(older_than).await
        }

        async fn query_by_tag_contains(&self, tag: &str) -> Result<Vec<String>> {
            self.inner.query_by_tag_contains(tag).await
        }

        async fn query_by_key_like(&self, pattern: &str) -> Result<Vec<String>> {
            self.inner.query_by_key_like(pattern).await
        }

        async fn query_by_dependency_contains(&self, key: &str) -> Result<Vec<String>> {
            self.inner.query_by_dependency_contains(key).await
        }
    }

    fn cache_with(config: CacheConfig) -> (TieredCache, Arc<MemoryPersistentStore>) {
        let durable = Arc::new(MemoryPersistentStore::new());
        (TieredCache::new(config, durable.clone()), durable)
    }

    fn cache() -> (TieredCache, Arc<MemoryPersistentStore>) {
        cache_with(CacheConfig::default())
    }

    #[tokio::test]
    async fn test_read_your_write() {
        let (cache, durable) = cache();
        cache.set("a", &json!({"x": 1}), SetOptions::new()).await.unwrap();

        let value: Option<Value> = cache.get("a").await.unwrap();
        assert_eq!(value, Some(json!({"x": 1})));
        assert!(durable.contains("a").await, "write-through must reach durable tier");
    }

    #[tokio::test]
    async fn test_miss_in_both_tiers() {
        let (cache, _) = cache();
        let value: Option<Value> = cache.get("nope").await.unwrap();
        assert!(value.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_removes_entry() {
        let (cache, durable) = cache();
        cache
            .set("a", &json!({"x": 1}), SetOptions::new().ttl(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let value: Option<Value> = cache.get("a").await.unwrap();
        assert!(value.is_none());
        assert!(!cache.contains("a").await);
        assert!(!durable.contains("a").await, "expired durable copy is deleted");
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let (cache, _) = cache();
        let result = cache.set("a", &1, SetOptions::new().ttl(0)).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_memory_miss_repopulates_from_durable() {
        let (cache, durable) = cache();
        let other = TieredCache::new(CacheConfig::default(), durable.clone());
        other
            .set("shared", &json!(["a", "b"]), SetOptions::new().tags(["grp"]))
            .await
            .unwrap();

        assert!(!cache.contains("shared").await);
        let value: Option<Value> = cache.get("shared").await.unwrap();
        assert_eq!(value, Some(json!(["a", "b"])));
        assert!(cache.contains("shared").await);

        let info = cache.inspect("shared").await.unwrap();
        assert_eq!(info.tags, vec!["grp".to_string()]);
        assert_eq!(cache.stats().await.persistent_hits, 1);
    }

    #[tokio::test]
    async fn test_durable_read_failure_is_a_miss() {
        let (cache, durable) = cache();
        durable.fail_reads(true);

        let value: Option<Value> = cache.get("x").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_slow_durable_store_degrades_to_miss() {
        let config = CacheConfig::default().with_store_timeout(Duration::from_millis(20));
        let (cache, durable) = cache_with(config);
        durable.set_latency(Duration::from_millis(200));

        let value: Option<Value> = cache.get("slow").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_durable_write_failure_rolls_back_memory() {
        let (cache, durable) = cache();
        durable.fail_writes(true);

        let result = cache.set("k", &42, SetOptions::new()).await;
        assert!(matches!(result, Err(CacheError::Persistence(_))));
        assert!(!cache.contains("k").await);
        assert_eq!(cache.stats().await.memory_usage, 0);
    }

    #[tokio::test]
    async fn test_durable_write_timeout_is_surfaced() {
        let config = CacheConfig::default().with_store_timeout(Duration::from_millis(20));
        let (cache, durable) = cache_with(config);
        durable.set_latency(Duration::from_millis(200));

        let result = cache.set("k", &1, SetOptions::new()).await;
        assert!(matches!(result, Err(CacheError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_delete_both_tiers() {
        let (cache, durable) = cache();
        cache.set("k", &1, SetOptions::new()).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!durable.contains("k").await);
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let (cache, _) = cache();
        cache.set("b", &123, SetOptions::new().tags(["grp"])).await.unwrap();
        cache.set("c", &456, SetOptions::new().tags(["grp"])).await.unwrap();
        cache.set("d", &789, SetOptions::new().tags(["other"])).await.unwrap();

        let removed = cache.invalidate(Invalidation::Tag("grp".into())).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(cache.get::<i32>("b").await.unwrap(), None);
        assert_eq!(cache.get::<i32>("c").await.unwrap(), None);
        assert_eq!(cache.get::<i32>("d").await.unwrap(), Some(789));
    }

    #[tokio::test]
    async fn test_invalidate_tag_reaches_durable_only_records() {
        let (cache, durable) = cache();
        let writer = TieredCache::new(CacheConfig::default(), durable.clone());
        writer.set("remote", &1, SetOptions::new().tags(["grp"])).await.unwrap();

        let removed = cache.invalidate(Invalidation::Tag("grp".into())).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!durable.contains("remote").await);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let (cache, _) = cache();
        cache.set("design:1:home", &1, SetOptions::new()).await.unwrap();
        cache.set("design:2:home", &2, SetOptions::new()).await.unwrap();
        cache.set("user:1", &3, SetOptions::new()).await.unwrap();

        let removed = cache
            .invalidate(Invalidation::Pattern("design:*".into()))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(cache.get::<i32>("user:1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_invalidate_dependencies_is_transitive() {
        let (cache, _) = cache();
        cache.set("q", &0, SetOptions::new()).await.unwrap();
        cache.set("p", &1, SetOptions::new().dependencies(["q"])).await.unwrap();
        cache.set("r", &2, SetOptions::new().dependencies(["p"])).await.unwrap();
        cache.set("s", &3, SetOptions::new()).await.unwrap();

        let removed = cache
            .invalidate(Invalidation::Dependencies(vec!["q".into()]))
            .await
            .unwrap();

        assert_eq!(removed, 3);
        for key in ["p", "q", "r"] {
            assert_eq!(cache.get::<i32>(key).await.unwrap(), None, "{} should miss", key);
        }
        assert_eq!(cache.get::<i32>("s").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_dependency_cycle_terminates() {
        let (cache, _) = cache();
        cache.set("a", &1, SetOptions::new().dependencies(["b"])).await.unwrap();
        cache.set("b", &2, SetOptions::new().dependencies(["a"])).await.unwrap();

        let removed = cache
            .invalidate(Invalidation::Dependencies(vec!["a".into()]))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_wins_over_overlapping_durable_read() {
        let durable = Arc::new(MemoryPersistentStore::new());
        let writer = TieredCache::new(CacheConfig::default(), durable.clone());
        writer.set("k", &1, SetOptions::new().tags(["grp"])).await.unwrap();

        let lagging = Arc::new(LaggingReads {
            inner: durable.clone(),
            lag: Duration::from_millis(200),
        });
        let cache = TieredCache::new(CacheConfig::default(), lagging);

        let reader = cache.clone();
        let racing = tokio::spawn(async move { reader.get::<i32>("k").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let removed = cache.invalidate(Invalidation::Tag("grp".into())).await.unwrap();
        assert_eq!(removed, 1);

        // the overlapping read may still answer with the old value
        racing.await.unwrap().unwrap();

        assert!(!cache.contains("k").await, "invalidated value came back");
        assert_eq!(cache.get::<i32>("k").await.unwrap(), None);
        assert!(!durable.contains("k").await);
    }

    #[tokio::test]
    async fn test_delete_wins_over_overlapping_durable_read() {
        let durable = Arc::new(MemoryPersistentStore::new());
        let writer = TieredCache::new(CacheConfig::default(), durable.clone());
        writer.set("k", &1, SetOptions::new()).await.unwrap();

        let lagging = Arc::new(LaggingReads {
            inner: durable.clone(),
            lag: Duration::from_millis(200),
        });
        let cache = TieredCache::new(CacheConfig::default(), lagging);

        let reader = cache.clone();
        let racing = tokio::spawn(async move { reader.get::<i32>("k").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cache.delete("k").await.unwrap());
        racing.await.unwrap().unwrap();

        assert!(!cache.contains("k").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_keep_accounting_consistent() {
        // every value `"v00N"` serializes to 6 bytes; 16 keys overflow 60
        let config = CacheConfig::default()
            .with_max_memory(60)
            .with_compression_threshold(10_000);
        let (cache, _) = cache_with(config);
        let keys: Vec<String> = (0..16).map(|i| format!("k{}", i)).collect();

        let mut tasks = Vec::new();
        for worker in 0..8usize {
            let cache = cache.clone();
            let keys = keys.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..60usize {
                    let key = &keys[(worker * 7 + round * 3) % keys.len()];
                    match (worker + round) % 5 {
                        0 | 1 => {
                            let options = SetOptions::new()
                                .tags([format!("t{}", round % 3)])
                                .dependencies([keys[round % keys.len()].clone()]);
                            let value = format!("v{:03}", round);
                            cache.set(key, &value, options).await.unwrap();
                        }
                        2 => {
                            cache.get::<String>(key).await.unwrap();
                        }
                        3 => {
                            cache.delete(key).await.unwrap();
                        }
                        _ if round % 2 == 0 => {
                            let tag = format!("t{}", round % 3);
                            cache.invalidate(Invalidation::Tag(tag)).await.unwrap();
                        }
                        _ => {
                            let roots = vec![key.clone()];
                            cache.invalidate(Invalidation::Dependencies(roots)).await.unwrap();
                        }
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = cache.stats().await;
        let store = cache.store.read().await;

        let mut live = 0;
        let mut tags: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, HashSet<String>> = HashMap::new();
        for key in &keys {
            if let Some(entry) = store.entry(key) {
                live += entry.size_bytes;
                for tag in &entry.tags {
                    tags.entry(tag.clone()).or_default().insert(key.clone());
                }
                for dep in &entry.dependencies {
                    dependents.entry(dep.clone()).or_default().insert(key.clone());
                }
            }
        }

        assert_eq!(store.memory_usage(), live);
        assert_eq!(stats.memory_usage, live);
        assert!(live <= 60);
        assert_eq!(store.index().tagged_keys(), tags);
        assert_eq!(store.index().dependent_keys(), dependents);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_corrupted() {
        let (cache, _) = cache();
        cache.set("k", &"text", SetOptions::new()).await.unwrap();

        let result = cache.get::<u32>("k").await;
        assert!(matches!(result, Err(CacheError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_invalidate_survives_durable_outage() {
        let (cache, durable) = cache();
        cache.set("b", &1, SetOptions::new().tags(["grp"])).await.unwrap();
        durable.fail_reads(true);
        durable.fail_writes(true);

        let removed = cache.invalidate(Invalidation::Tag("grp".into())).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.contains("b").await);
    }

    #[tokio::test]
    async fn test_memory_budget_and_lru_order() {
        // each value `"vN"` serializes to 4 bytes
        let config = CacheConfig::default().with_max_memory(12);
        let (cache, _) = cache_with(config);

        for key in ["k1", "k2", "k3"] {
            cache.set(key, &"v1", SetOptions::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // touch k1 so k2 becomes least recently used
        assert!(cache.get::<String>("k1").await.unwrap().is_some());

        cache.set("k4", &"v4", SetOptions::new()).await.unwrap();

        let stats = cache.stats().await;
        assert!(stats.memory_usage <= 12);
        assert_eq!(stats.evictions, 1);
        assert!(cache.contains("k1").await);
        assert!(!cache.contains("k2").await);
        assert!(cache.contains("k3").await);
    }

    #[tokio::test]
    async fn test_entry_over_max_size_rejected() {
        let (cache, _) = cache();
        let result = cache
            .set("k", &"x".repeat(100), SetOptions::new().max_size(10).compress(false))
            .await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_large_values_are_compressed_transparently() {
        let (cache, durable) = cache();
        let doc = json!({ "body": "lorem ipsum ".repeat(500) });
        cache.set("doc", &doc, SetOptions::new()).await.unwrap();

        let info = cache.inspect("doc").await.unwrap();
        assert!(info.compressed);
        assert!(durable.get_by_key("doc").await.unwrap().unwrap().compressed);
        assert!(cache.stats().await.compression_ratio > 1.0);

        // evict memory copy to force the durable decompress path
        cache.store.write().await.remove("doc");
        let back: Option<Value> = cache.get("doc").await.unwrap();
        assert_eq!(back, Some(doc));
    }

    #[tokio::test]
    async fn test_update_reuses_options() {
        let (cache, _) = cache();
        cache
            .set("counter", &1u32, SetOptions::new().tags(["counters"]).ttl(120))
            .await
            .unwrap();
        let before = cache.inspect("counter").await.unwrap().version;

        let next = cache
            .update("counter", |n: Option<u32>| n.unwrap_or(0) + 1, SetOptions::new())
            .await
            .unwrap();

        assert_eq!(next, 2);
        let info = cache.inspect("counter").await.unwrap();
        assert_eq!(info.tags, vec!["counters".to_string()]);
        assert_eq!(info.ttl_seconds, 120);
        assert!(info.version > before);
    }

    #[tokio::test]
    async fn test_update_missing_uses_fallback() {
        let (cache, _) = cache();
        let next = cache
            .update("fresh", |n: Option<u32>| n.unwrap_or(10), SetOptions::new().tags(["t"]))
            .await
            .unwrap();

        assert_eq!(next, 10);
        assert_eq!(cache.inspect("fresh").await.unwrap().tags, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_warmup_skips_cached_and_counts_failures() {
        let (cache, _) = cache();
        cache.set("cached", &0, SetOptions::new()).await.unwrap();

        let keys: Vec<String> = ["cached", "fetch", "absent", "broken"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = cache
            .warmup(&keys, SetOptions::new(), |key: String| async move {
                match key.as_str() {
                    "fetch" => Ok(Some(7)),
                    "absent" => Ok(None),
                    _ => Err(anyhow::anyhow!("upstream unavailable")),
                }
            })
            .await;

        assert_eq!(
            report,
            WarmupReport {
                loaded: 1,
                skipped: 1,
                missing: 1,
                failed: 1
            }
        );
        assert_eq!(cache.get::<i32>("fetch").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_run_maintenance_purges_expired() {
        let (cache, _) = cache();
        cache.set("short", &1, SetOptions::new().ttl(1)).await.unwrap();
        cache.set("long", &2, SetOptions::new().ttl(600)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let report = cache.run_maintenance().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.persistent_purged, Some(0));
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_access_metadata_tracks_reads() {
        let (cache, _) = cache();
        cache.set("k", &1, SetOptions::new()).await.unwrap();
        let before = cache.inspect("k").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get::<i32>("k").await.unwrap();
        cache.get::<i32>("k").await.unwrap();

        let after = cache.inspect("k").await.unwrap();
        assert_eq!(after.access_count, 2);
        assert!(after.last_accessed_at > before.last_accessed_at);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (cache, _) = cache();
        assert!(cache.start_maintenance().await);
        assert!(!cache.start_maintenance().await);

        cache.close().await;
        cache.close().await;
        assert!(cache.is_closed());
        assert!(!cache.start_maintenance().await);
    }
}
