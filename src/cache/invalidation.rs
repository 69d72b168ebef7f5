//! Invalidation Engine
//!
//! Keeps the tag index and the dependency graph in step with live entries,
//! and translates key patterns for both tiers.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

// == Invalidation Criterion ==
/// What to invalidate. Serialized as `{"tag": ..}`, `{"pattern": ..}` or
/// `{"dependencies": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Invalidation {
    /// Every entry carrying the tag
    Tag(String),
    /// Every key matching a glob (`*` any run, `?` one character)
    Pattern(String),
    /// The listed keys plus everything that transitively depends on them
    Dependencies(Vec<String>),
}

// == Invalidation Index ==
/// Tag index and reverse dependency graph over memory-tier keys.
///
/// Invariants, maintained by [`CacheStore`](super::CacheStore):
/// - a key is under a tag iff a live entry with that key carries the tag
/// - a key is a dependent in the graph iff a live entry with that key lists the dependency
#[derive(Debug, Default)]
pub struct InvalidationIndex {
    tags: HashMap<String, HashSet<String>>,
    /// dependency key -> keys that depend on it
    dependents: HashMap<String, HashSet<String>>,
}

impl InvalidationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key` under each tag and as a dependent of each dependency.
    pub fn register(&mut self, key: &str, tags: &BTreeSet<String>, deps: &BTreeSet<String>) {
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        for dep in deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Removes `key` from the given tags and dependency edges, dropping empty sets.
    pub fn deregister(&mut self, key: &str, tags: &BTreeSet<String>, deps: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        for dep in deps {
            if let Some(keys) = self.dependents.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
    }

    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `key`.
    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        self.dependents
            .get(key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Breadth-first closure of `roots` over the dependency graph, roots included.
    ///
    /// Tracks visited keys, so cycles terminate.
    pub fn cascade<I, S>(&self, roots: I) -> HashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().map(Into::into).collect();

        while let Some(key) = queue.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(next) = self.dependents.get(&key) {
                queue.extend(next.iter().filter(|k| !visited.contains(*k)).cloned());
            }
        }

        visited
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.values().map(HashSet::len).sum()
    }

    /// True when no key is referenced anywhere in the index.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.dependents.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tagged_keys(&self) -> HashMap<String, HashSet<String>> {
        self.tags.clone()
    }

    #[cfg(test)]
    pub(crate) fn dependent_keys(&self) -> HashMap<String, HashSet<String>> {
        self.dependents.clone()
    }
}

// == Key Pattern ==
/// A glob over cache keys, usable against memory (regex) and SQL (`LIKE`).
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn parse(glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(CacheError::InvalidRequest(
                "Pattern cannot be empty".to_string(),
            ));
        }

        let mut source = String::with_capacity(glob.len() + 8);
        source.push_str("(?s)^");
        for c in glob.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| CacheError::InvalidRequest(format!("Invalid pattern: {}", e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// SQL `LIKE` form, to be used with `ESCAPE '\'`.
    pub fn to_like(&self) -> String {
        let mut like = String::with_capacity(self.glob.len());
        for c in self.glob.chars() {
            match c {
                '*' => like.push('%'),
                '?' => like.push('_'),
                '%' | '_' | '\\' => {
                    like.push('\\');
                    like.push(c);
                }
                other => like.push(other),
            }
        }
        like
    }
}

/// Compiles a SQL `LIKE` pattern (escape character `\`) to an anchored regex.
pub fn like_to_regex(like: &str) -> Result<Regex> {
    let mut source = String::from("(?s)^");
    let mut chars = like.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    source.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4])));
                }
            }
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| CacheError::InvalidRequest(format!("Invalid pattern: {}", e)))
}
