//! Cache Store Module
//!
//! Memory tier: entry table, size accounting, invalidation indices and eviction.
//!
//! The store is not synchronized itself; [`TieredCache`](super::TieredCache)
//! wraps it in an `RwLock`. Every mutation of entries, indices or
//! `memory_usage` takes `&mut self`, so they all sit behind one write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::cache::{
    CacheEntry, EvictionPolicy, InvalidationIndex, KeyPattern, NewEntry, MAX_KEY_LENGTH,
};
use crate::error::{CacheError, Result};

/// Stored bytes of a hit, decoded by the caller outside the lock.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Arc<[u8]>,
    pub compressed: bool,
}

/// Result of a memory-tier read.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Payload),
    /// Present but stale; the caller must purge it under the write lock
    Expired,
    Missing,
}

/// Result of an admitted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub version: u64,
    /// Keys evicted to make room, in eviction order
    pub evicted: Vec<String>,
}

// == Cache Store ==
#[derive(Debug)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    index: InvalidationIndex,
    policy: EvictionPolicy,
    /// Sum of `size_bytes` over live entries
    memory_usage: usize,
    max_memory: usize,
    next_version: u64,
    /// Bumped by every invalidation; repopulation from an older generation is refused
    generation: u64,
    clock: AtomicU64,
}

impl CacheStore {
    // == Constructor ==
    /// Creates an empty store with a memory budget in bytes.
    pub fn new(max_memory: usize) -> Self {
        Self {
            entries: HashMap::new(),
            index: InvalidationIndex::new(),
            policy: EvictionPolicy::new(),
            memory_usage: 0,
            max_memory,
            next_version: 0,
            generation: 0,
            clock: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    // == Insert ==
    /// Admits an entry, evicting LRU victims until it fits the budget.
    ///
    /// Overwrites release the previous entry's size and index membership first.
    /// Every admitted write receives a fresh, strictly increasing version.
    pub fn insert(&mut self, new: NewEntry, now: u64) -> Result<InsertOutcome> {
        validate_key(&new.key)?;

        let size = new.payload.len();
        if size > self.max_memory {
            return Err(CacheError::CacheFull(format!(
                "Entry '{}' of {} bytes exceeds the memory budget of {} bytes",
                new.key, size, self.max_memory
            )));
        }

        self.remove(&new.key);

        let mut evicted = Vec::new();
        while self.memory_usage + size > self.max_memory {
            let Some(victim) = self.policy.select_victim(self.entries.values()) else {
                break;
            };
            if victim.exempt_fallback {
                warn!(
                    key = %victim.key,
                    "All resident entries are eviction-exempt, evicting least recently used"
                );
            }
            self.remove(&victim.key);
            evicted.push(victim.key);
        }

        self.next_version += 1;
        let version = self.next_version;
        let entry = CacheEntry::new(new, version, now, self.next_tick());

        self.index
            .register(&entry.key, &entry.tags, &entry.dependencies);
        self.memory_usage += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);

        Ok(InsertOutcome { version, evicted })
    }

    /// Inserts only if no live entry holds the key and no invalidation has
    /// run since `generation` was read.
    ///
    /// Used when repopulating from the durable tier. A concurrent newer write
    /// is never replaced by an older durable copy, and a copy read before an
    /// invalidation never comes back after it.
    pub fn populate(
        &mut self,
        new: NewEntry,
        now: u64,
        generation: u64,
    ) -> Result<Option<InsertOutcome>> {
        if generation != self.generation || self.contains_live(&new.key, now) {
            return Ok(None);
        }
        self.insert(new, now).map(Some)
    }

    // == Lookup ==
    /// Reads an entry, recording the access on a hit.
    ///
    /// Only touches atomic access metadata, so a shared borrow suffices.
    pub fn lookup(&self, key: &str, now: u64) -> Lookup {
        match self.entries.get(key) {
            None => Lookup::Missing,
            Some(entry) if entry.is_expired_at(now) => Lookup::Expired,
            Some(entry) => {
                entry.touch(now, self.next_tick());
                Lookup::Hit(Payload {
                    bytes: Arc::clone(&entry.payload),
                    compressed: entry.compressed,
                })
            }
        }
    }

    // == Remove ==
    /// Removes an entry and its index membership, releasing its bytes.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.index
            .deregister(key, &entry.tags, &entry.dependencies);
        debug_assert!(self.memory_usage >= entry.size_bytes);
        self.memory_usage = self.memory_usage.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Removes `keys` as one invalidation and advances the generation.
    /// Returns the keys that were resident.
    pub fn invalidate<'a, I>(&mut self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.generation += 1;
        keys.into_iter()
            .filter(|key| self.remove(key).is_some())
            .cloned()
            .collect()
    }

    /// Removes `key` only if it is still expired at `now`.
    pub fn remove_if_expired(&mut self, key: &str, now: u64) -> bool {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired_at(now));
        expired && self.remove(key).is_some()
    }

    /// Removes `key` only if it still holds the given write version.
    pub fn remove_if_version(&mut self, key: &str, version: u64) -> bool {
        let current = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.version == version);
        current && self.remove(key).is_some()
    }

    // == Introspection ==
    /// Snapshot of the keys that are expired at `now`.
    pub fn expired_keys(&self, now: u64) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        self.entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.index.keys_for_tag(tag)
    }

    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        self.index.dependents_of(key)
    }

    pub fn index(&self) -> &InvalidationIndex {
        &self.index
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains_live(&self, key: &str, now: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    // == Length ==
    /// Returns the current number of entries in the memory tier.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rejects empty keys and keys over [`MAX_KEY_LENGTH`] bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}
