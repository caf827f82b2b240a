//! Persistent, content-addressed result cache.
//!
//! Results of analytical queries are stored under keys derived from the
//! function identity and the call arguments, so repeated calls skip the
//! database entirely and survive restarts.
//!
//! # Key Format
//!
//! ```text
//! {namespace}-{fn_fingerprint}-{arg_fingerprint}  -> {"is_async":true,"value":...}
//! epoch:{namespace}                               -> sha-256 of the loaded database
//! ```
//!
//! # Invalidation
//!
//! Every entry belongs to one database epoch. When [`ResultCache::observe_epoch`]
//! sees a different epoch than the stored one, the whole namespace is removed
//! before the new epoch is recorded, and results computed under the old epoch
//! are refused on write.

mod cached;
mod fingerprint;
mod hash;
mod sqlite_store;
mod store;

pub use cached::Cached;
pub use fingerprint::{argument_fingerprint, function_fingerprint, tagged_segment, CacheArgs};
pub use hash::{hash_segment, string_hash};
pub use sqlite_store::{CacheStats, SqliteStore};
pub use store::{CacheStore, MemoryStore};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Settings, SettingsError};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "database";

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache configuration: {0}")]
    Config(#[from] SettingsError),

    #[error("cache quota exceeded: {needed} bytes needed, limit is {limit}")]
    QuotaExceeded { needed: usize, limit: usize },
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Whether the producing call was asynchronous. Informational only: a hit
    /// is returned in the shape of the method that reads it (`call` hands it
    /// back from a future, `call_sync` directly), so an entry written by one
    /// shape serves the other.
    pub is_async: bool,
    pub value: Value,
}

/// Results that are never cached, so "no data" is retried next time.
pub fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Namespaced result cache over a [`CacheStore`].
///
/// Store failures never reach callers: reads degrade to misses and writes
/// are dropped, both with a warning.
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    namespace: String,
    enabled: bool,
    generation: AtomicU64,
    // writers take it shared; epoch rotation takes it exclusively
    rotation: RwLock<()>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_namespace(store, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(store: Arc<dyn CacheStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            enabled: true,
            generation: AtomicU64::new(0),
            rotation: RwLock::new(()),
        }
    }

    /// A cache that always misses and never writes.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Arc::new(MemoryStore::new()))
        }
    }

    /// Build the cache described by `[cache]` in the settings.
    pub fn from_settings(settings: &Settings) -> CacheResult<Self> {
        let cfg = &settings.cache;
        if !cfg.enabled {
            return Ok(Self::disabled());
        }

        let store: Arc<dyn CacheStore> = if cfg.persistent {
            let path = match settings.cache_path()? {
                Some(path) => path,
                None => SqliteStore::default_path()?,
            };
            let mut store = SqliteStore::open_at(&path)?;
            if let Some(bytes) = cfg.quota_bytes {
                store = store.with_quota(bytes);
            }
            debug!(path = %path.display(), "cache: opened persistent store");
            Arc::new(store)
        } else {
            Arc::new(match cfg.quota_bytes {
                Some(bytes) => MemoryStore::with_quota(bytes),
                None => MemoryStore::new(),
            })
        };
        Ok(Self::with_namespace(store, cfg.namespace.clone()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bumped on every epoch rotation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Key of one cached call.
    pub fn entry_key(&self, fn_fingerprint: &str, arg_fingerprint: &str) -> String {
        format!("{}-{}-{}", self.namespace, fn_fingerprint, arg_fingerprint)
    }

    fn namespace_prefix(&self) -> String {
        format!("{}-", self.namespace)
    }

    fn epoch_key(&self) -> String {
        format!("epoch:{}", self.namespace)
    }

    /// The epoch recorded in the store, if any.
    pub fn stored_epoch(&self) -> CacheResult<Option<String>> {
        self.store.get(&self.epoch_key())
    }

    /// Record the epoch of the database now loaded. If it differs from the
    /// stored one, every entry in the namespace is removed first. Returns
    /// whether the cache was rotated.
    pub fn observe_epoch(&self, epoch: &str) -> CacheResult<bool> {
        let _exclusive = self
            .rotation
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = self.store.get(&self.epoch_key())?;
        if previous.as_deref() == Some(epoch) {
            debug!(epoch, "cache: epoch unchanged");
            return Ok(false);
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        let removed = self.store.remove_prefix(&self.namespace_prefix())?;
        self.store.set(&self.epoch_key(), epoch)?;
        info!(
            namespace = %self.namespace,
            previous = previous.as_deref().unwrap_or("none"),
            epoch,
            removed,
            "cache: epoch changed, namespace cleared"
        );
        Ok(true)
    }

    /// Read an entry. Unreadable entries count as misses.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let raw = match self.store.get(key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(key, error = %err, "cache: read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(key, error = %err, "cache: dropping unreadable entry");
                self.evict(key);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.store.has(key).unwrap_or_else(|err| {
            warn!(key, error = %err, "cache: membership check failed");
            false
        })
    }

    /// Write an entry computed under `generation`. Empty values, stale
    /// generations and store failures are skipped. Returns whether it was
    /// written.
    pub fn store_entry(&self, key: &str, entry: &CacheEntry, generation: u64) -> bool {
        if !self.enabled || is_empty_result(&entry.value) {
            return false;
        }
        let _shared = self.rotation.read().unwrap_or_else(PoisonError::into_inner);
        if generation != self.generation() {
            debug!(key, "cache: result predates epoch change, not stored");
            return false;
        }

        let text = match serde_json::to_string(entry) {
            Ok(text) => text,
            Err(err) => {
                warn!(key, error = %err, "cache: failed to serialize result");
                return false;
            }
        };
        match self.store.set(key, &text) {
            Ok(()) => true,
            Err(err) => {
                warn!(key, error = %err, "cache: write failed, result not cached");
                false
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn evict(&self, key: &str) -> bool {
        self.store.remove(key).unwrap_or_else(|err| {
            warn!(key, error = %err, "cache: eviction failed");
            false
        })
    }

    /// Remove every entry in the namespace (the stored epoch stays).
    pub fn clear(&self) -> CacheResult<usize> {
        let _exclusive = self
            .rotation
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.store.remove_prefix(&self.namespace_prefix())
    }

    /// Keys of all entries in the namespace.
    pub fn keys(&self) -> CacheResult<Vec<String>> {
        self.store.keys_with_prefix(&self.namespace_prefix())
    }
}
