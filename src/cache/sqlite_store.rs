//! SQLite-backed cache store.
//!
//! Results persist across restarts in `~/.chatstats/cache.db`.
//!
//! # Design
//!
//! - Flat key/value table with JSON text values
//! - No TTL; entries live until the epoch changes or they are evicted
//! - Versioned; the whole file is wiped on a format version mismatch
//! - Optional byte quota over keys plus values

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::store::CacheStore;
use super::{CacheError, CacheResult};

/// Current cache schema version. Bump this when the entry format changes.
const CACHE_VERSION: i32 = 1;

/// Persistent store for cached results.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota: Option<usize>,
}

impl SqliteStore {
    /// Open or create the store at the default location.
    pub fn open() -> CacheResult<Self> {
        Self::open_at(Self::default_path()?)
    }

    /// Open or create the store at `path`, creating parent directories.
    pub fn open_at(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Default store location.
    pub fn default_path() -> CacheResult<PathBuf> {
        let base = dirs::home_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(base.join(".chatstats").join("cache.db"))
    }

    /// Limit the store to `bytes` of keys plus values.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    fn from_connection(conn: Connection) -> CacheResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            quota: None,
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the schema and check the format version.
    fn init(&self) -> CacheResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == CACHE_VERSION => {}
            Some(v) => {
                info!(found = v, expected = CACHE_VERSION, "cache: version mismatch, clearing");
                conn.execute("DELETE FROM cache", [])?;
                set_version(&conn)?;
            }
            None => set_version(&conn)?,
        }

        Ok(())
    }

    /// Clear all entries (but keep metadata).
    pub fn clear_all(&self) -> CacheResult<()> {
        self.conn().execute("DELETE FROM cache", [])?;
        Ok(())
    }

    /// Get store statistics.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn();
        let (entry_count, total_size) = stats_of(&conn)?;
        Ok(CacheStats {
            entry_count,
            total_size_bytes: total_size,
        })
    }
}

fn set_version(conn: &Connection) -> CacheResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
        params![CACHE_VERSION.to_string()],
    )?;
    Ok(())
}

fn stats_of(conn: &Connection) -> CacheResult<(usize, usize)> {
    let (count, size): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM cache",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((count as usize, size as usize))
}

impl CacheStore for SqliteStore {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM cache WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> CacheResult<()> {
        let conn = self.conn();
        if let Some(limit) = self.quota {
            let (_, used) = stats_of(&conn)?;
            let replaced: Option<i64> = conn
                .query_row(
                    "SELECT LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB)) FROM cache WHERE key = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            let needed =
                used.saturating_sub(replaced.unwrap_or(0) as usize) + key.len() + value.len();
            if needed > limit {
                return Err(CacheError::QuotaExceeded { needed, limit });
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO cache (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn has(&self, key: &str) -> CacheResult<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row("SELECT 1 FROM cache WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn remove(&self, key: &str) -> CacheResult<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM cache WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    fn remove_prefix(&self, prefix: &str) -> CacheResult<usize> {
        // substr instead of LIKE: keys may contain `_` and `%`
        let rows = self.conn().execute(
            "DELETE FROM cache WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(rows)
    }

    fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT key FROM cache WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries in the cache.
    pub entry_count: usize,
    /// Total size of all keys and values in bytes.
    pub total_size_bytes: usize,
}
