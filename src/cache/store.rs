//! Key/value storage port for the result cache.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use super::{CacheError, CacheResult};

/// Flat string key/value storage. Values are JSON text.
///
/// Implementations must be safe to share between tasks; concurrent writes to
/// the same key may land in any order.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Insert or overwrite. Fails with [`CacheError::QuotaExceeded`] when the
    /// store has no room left.
    fn set(&self, key: &str, value: &str) -> CacheResult<()>;

    fn has(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> CacheResult<bool>;

    /// Remove every key starting with `prefix`; returns how many went.
    fn remove_prefix(&self, prefix: &str) -> CacheResult<usize>;

    fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;
}

/// In-process store, optionally limited to a number of bytes (keys plus
/// values).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
    used: AtomicUsize,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently held.
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> CacheResult<()> {
        let size = key.len() + value.len();
        if let Some(limit) = self.quota {
            let replaced = self
                .entries
                .get(key)
                .map_or(0, |old| key.len() + old.len());
            let needed = self.used_bytes().saturating_sub(replaced) + size;
            if needed > limit {
                return Err(CacheError::QuotaExceeded { needed, limit });
            }
        }

        if let Some(old) = self.entries.insert(key.to_string(), value.to_string()) {
            self.used.fetch_sub(key.len() + old.len(), Ordering::SeqCst);
        }
        self.used.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn has(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn remove(&self, key: &str) -> CacheResult<bool> {
        match self.entries.remove(key) {
            Some((k, v)) => {
                self.used.fetch_sub(k.len() + v.len(), Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let mut removed = 0;
        let mut freed = 0;
        self.entries.retain(|k, v| {
            if k.starts_with(prefix) {
                removed += 1;
                freed += k.len() + v.len();
                false
            } else {
                true
            }
        });
        self.used.fetch_sub(freed, Ordering::SeqCst);
        Ok(removed)
    }

    fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}
