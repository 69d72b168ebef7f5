//! In-process durable tier.
//!
//! Keeps records in a map. Reads and writes can be made to fail or stall,
//! which exercises the cache's fail-open and timeout paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{PersistentRecord, PersistentStore};
use crate::cache::like_to_regex;
use crate::error::{CacheError, Result};

#[derive(Debug, Default)]
pub struct MemoryPersistentStore {
    records: RwLock<HashMap<String, PersistentRecord>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryPersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read/query fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every write/delete fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.records.read().await.contains_key(key)
    }

    async fn before_read(&self) -> Result<()> {
        self.stall().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Persistence("read failure injected".to_string()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<()> {
        self.stall().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Persistence("write failure injected".to_string()));
        }
        Ok(())
    }

    async fn stall(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn keys_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&PersistentRecord) -> bool,
    {
        self.records
            .read()
            .await
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.key.clone())
            .collect()
    }
}

#[async_trait]
impl PersistentStore for MemoryPersistentStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<PersistentRecord>> {
        self.before_read().await?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn upsert(&self, record: PersistentRecord) -> Result<()> {
        self.before_write().await?;
        self.records
            .write()
            .await
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool> {
        self.before_write().await?;
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn delete_where(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.before_write().await?;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.created_at >= older_than);
        Ok((before - records.len()) as u64)
    }

    async fn query_by_tag_contains(&self, tag: &str) -> Result<Vec<String>> {
        self.before_read().await?;
        Ok(self
            .keys_where(|record| record.tags.iter().any(|t| t == tag))
            .await)
    }

    async fn query_by_key_like(&self, pattern: &str) -> Result<Vec<String>> {
        self.before_read().await?;
        let regex = like_to_regex(pattern)?;
        Ok(self.keys_where(|record| regex.is_match(&record.key)).await)
    }

    async fn query_by_dependency_contains(&self, key: &str) -> Result<Vec<String>> {
        self.before_read().await?;
        Ok(self
            .keys_where(|record| record.dependencies.iter().any(|d| d == key))
            .await)
    }
}
