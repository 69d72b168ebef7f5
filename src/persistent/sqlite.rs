//! SQLite durable tier.
//!
//! One table, `cache_entries`, holding the record columns. Tags and
//! dependencies are JSON arrays queried through `json_each`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{timestamp_from_ms, PersistentRecord, PersistentStore};
use crate::cache::Priority;
use crate::error::{CacheError, Result};

const SELECT_COLUMNS: &str = "key, value, compressed, ttl, tags, dependencies, priority, size, created_at, updated_at";

/// SQLite-backed [`PersistentStore`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a database file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_error)?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                ttl INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                dependencies TEXT NOT NULL DEFAULT '[]',
                priority TEXT NOT NULL DEFAULT 'medium',
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_entries_created
                ON cache_entries(created_at);",
        )
        .map_err(db_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| CacheError::Persistence("sqlite connection poisoned".to_string()))?;
            f(&guard).map_err(db_error)
        })
        .await
        .map_err(|e| CacheError::Internal(format!("sqlite task failed: {}", e)))?
    }

    async fn query_keys(&self, sql: &'static str, arg: String) -> Result<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![arg], |row| row.get::<_, String>(0))?;
            let keys = rows.collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
        .await
    }
}

fn db_error(e: rusqlite::Error) -> CacheError {
    CacheError::Persistence(format!("sqlite: {}", e))
}

/// Rewrites a `\`-escaped LIKE pattern as the equivalent GLOB.
fn like_to_glob(like: &str) -> String {
    let mut glob = String::with_capacity(like.len());
    let mut chars = like.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    push_glob_literal(&mut glob, escaped);
                }
            }
            '%' => glob.push('*'),
            '_' => glob.push('?'),
            other => push_glob_literal(&mut glob, other),
        }
    }
    glob
}

fn push_glob_literal(glob: &mut String, c: char) {
    if matches!(c, '*' | '?' | '[') {
        glob.push('[');
        glob.push(c);
        glob.push(']');
    } else {
        glob.push(c);
    }
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PersistentRecord> {
    let priority: String = row.get(6)?;
    let size: i64 = row.get(7)?;
    let ttl: i64 = row.get(3)?;
    let created_at: i64 = row.get(8)?;
    let updated_at: i64 = row.get(9)?;

    Ok(PersistentRecord {
        key: row.get(0)?,
        value: row.get(1)?,
        compressed: row.get(2)?,
        ttl: ttl.max(0) as u64,
        tags: json_list(row, 4)?,
        dependencies: json_list(row, 5)?,
        priority: Priority::parse(&priority),
        size: size.max(0) as usize,
        created_at: timestamp_from_ms(created_at.max(0) as u64),
        updated_at: timestamp_from_ms(updated_at.max(0) as u64),
    })
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<PersistentRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM cache_entries WHERE key = ?1", SELECT_COLUMNS),
                params![key],
                record_from_row,
            )
            .optional()
        })
        .await
    }

    async fn upsert(&self, record: PersistentRecord) -> Result<()> {
        let tags = serde_json::to_string(&record.tags)?;
        let deps = serde_json::to_string(&record.dependencies)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                    (key, value, compressed, ttl, tags, dependencies, priority, size, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.key,
                    record.value,
                    record.compressed,
                    i64::try_from(record.ttl).unwrap_or(i64::MAX),
                    tags,
                    deps,
                    record.priority.as_str(),
                    record.size as i64,
                    record.created_at.timestamp_millis(),
                    record.updated_at.timestamp_millis(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                .map(|n| n > 0)
        })
        .await
    }

    async fn delete_where(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE created_at < ?1",
                params![cutoff],
            )
            .map(|n| n as u64)
        })
        .await
    }

    async fn query_by_tag_contains(&self, tag: &str) -> Result<Vec<String>> {
        self.query_keys(
            "SELECT key FROM cache_entries
             WHERE EXISTS (SELECT 1 FROM json_each(cache_entries.tags) WHERE json_each.value = ?1)",
            tag.to_string(),
        )
        .await
    }

    /// Runs as `GLOB`; SQLite's `LIKE` folds ASCII case.
    async fn query_by_key_like(&self, pattern: &str) -> Result<Vec<String>> {
        self.query_keys(
            "SELECT key FROM cache_entries WHERE key GLOB ?1",
            like_to_glob(pattern),
        )
        .await
    }

    async fn query_by_dependency_contains(&self, key: &str) -> Result<Vec<String>> {
        self.query_keys(
            "SELECT key FROM cache_entries
             WHERE EXISTS (SELECT 1 FROM json_each(cache_entries.dependencies) WHERE json_each.value = ?1)",
            key.to_string(),
        )
        .await
    }
}
