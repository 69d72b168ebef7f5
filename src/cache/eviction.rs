//! Eviction Policy Module
//!
//! Chooses least-recently-used victims when the memory budget is exceeded.

use crate::cache::CacheEntry;

/// A chosen victim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub key: String,
    /// Set when every resident entry was exempt and the global LRU was taken instead
    pub exempt_fallback: bool,
}

// == Eviction Policy ==
/// Strict LRU over entries whose priority allows eviction.
///
/// When every resident entry is exempt, falls back to the globally least
/// recently used entry so a write can never be stuck behind pinned data.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictionPolicy;

impl EvictionPolicy {
    pub fn new() -> Self {
        Self
    }

    // == Select Victim ==
    /// Scans `entries` once and returns the eviction candidate, or None if empty.
    pub fn select_victim<'a, I>(&self, entries: I) -> Option<Victim>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        let mut evictable: Option<&CacheEntry> = None;
        let mut oldest: Option<&CacheEntry> = None;

        for entry in entries {
            if oldest.map_or(true, |o| entry.recency() < o.recency()) {
                oldest = Some(entry);
            }
            if entry.priority.is_evictable()
                && evictable.map_or(true, |e| entry.recency() < e.recency())
            {
                evictable = Some(entry);
            }
        }

        match (evictable, oldest) {
            (Some(entry), _) => Some(Victim {
                key: entry.key.clone(),
                exempt_fallback: false,
            }),
            (None, Some(entry)) => Some(Victim {
                key: entry.key.clone(),
                exempt_fallback: true,
            }),
            (None, None) => None,
        }
    }
}
