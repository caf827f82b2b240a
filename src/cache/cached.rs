//! Caching facade around data-producing functions.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::fingerprint::{argument_fingerprint, function_fingerprint, CacheArgs};
use super::{CacheEntry, ResultCache};

/// A function wrapped with the result cache.
///
/// The function identity must be stable across runs (the [`cached_fn!`]
/// macro derives it from the function path). Arguments are passed as a
/// tuple, see [`CacheArgs`].
///
/// ```ignore
/// let count = cached_fn!(cache.clone(), message_count);
/// let first = count.call((42,)).await;   // runs message_count
/// assert!(count.has_cache_for(&(42,)));
/// let second = count.call((42,)).await;  // served from the cache
/// ```
///
/// [`cached_fn!`]: crate::cached_fn
pub struct Cached<F> {
    cache: Arc<ResultCache>,
    identity: String,
    fn_fingerprint: String,
    f: F,
}

impl<F> Cached<F> {
    pub fn new(cache: Arc<ResultCache>, identity: impl Into<String>, f: F) -> Self {
        let identity = identity.into();
        Self {
            fn_fingerprint: function_fingerprint(&identity),
            identity,
            cache,
            f,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Cache key for `args`, or `None` if they cannot be fingerprinted (the
    /// call then bypasses the cache).
    pub fn key_for<A: CacheArgs>(&self, args: &A) -> Option<String> {
        match argument_fingerprint(args) {
            Ok(arg_fingerprint) => Some(self.cache.entry_key(&self.fn_fingerprint, &arg_fingerprint)),
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "cache: arguments not serializable");
                None
            }
        }
    }

    /// Whether a result for `args` is stored, without running anything.
    pub fn has_cache_for<A: CacheArgs>(&self, args: &A) -> bool {
        self.key_for(args).is_some_and(|key| self.cache.contains(&key))
    }

    fn hit<T: DeserializeOwned>(&self, key: Option<&str>) -> Option<T> {
        let key = key?;
        let CacheEntry { is_async, value } = self.cache.lookup(key)?;
        match serde_json::from_value(value) {
            Ok(value) => {
                debug!(identity = %self.identity, key, stored_async = is_async, "cache: hit");
                Some(value)
            }
            Err(err) => {
                warn!(identity = %self.identity, key, error = %err, "cache: stored value has wrong shape");
                self.cache.evict(key);
                None
            }
        }
    }

    fn remember<T: Serialize>(&self, key: Option<&str>, value: &T, is_async: bool, generation: u64) {
        let Some(key) = key else {
            return;
        };
        match serde_json::to_value(value) {
            Ok(value) => {
                self.cache
                    .store_entry(key, &CacheEntry { is_async, value }, generation);
            }
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "cache: result not serializable");
            }
        }
    }

    /// Call an async function, serving from the cache when possible.
    pub async fn call<A, Fut, T>(&self, args: A) -> T
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = T>,
        A: CacheArgs,
        T: Serialize + DeserializeOwned,
    {
        let key = self.key_for(&args);
        if let Some(value) = self.hit(key.as_deref()) {
            return value;
        }

        let generation = self.cache.generation();
        let value = (self.f)(args).await;
        self.remember(key.as_deref(), &value, true, generation);
        value
    }

    /// Call a fallible async function. Only `Ok` results are cached.
    pub async fn try_call<A, Fut, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: CacheArgs,
        T: Serialize + DeserializeOwned,
    {
        let key = self.key_for(&args);
        if let Some(value) = self.hit(key.as_deref()) {
            return Ok(value);
        }

        let generation = self.cache.generation();
        let value = (self.f)(args).await?;
        self.remember(key.as_deref(), &value, true, generation);
        Ok(value)
    }

    /// Call a synchronous function, serving from the cache when possible.
    pub fn call_sync<A, T>(&self, args: A) -> T
    where
        F: Fn(A) -> T,
        A: CacheArgs,
        T: Serialize + DeserializeOwned,
    {
        let key = self.key_for(&args);
        if let Some(value) = self.hit(key.as_deref()) {
            return value;
        }

        let generation = self.cache.generation();
        let value = (self.f)(args);
        self.remember(key.as_deref(), &value, false, generation);
        value
    }
}

/// Wrap a function in [`Cached`], using its module-qualified path as the
/// identity.
///
/// ```ignore
/// let overview = cached_fn!(cache.clone(), queries::thread_overview);
/// ```
#[macro_export]
macro_rules! cached_fn {
    ($cache:expr, $f:path) => {
        $crate::cache::Cached::new(
            $cache,
            concat!(module_path!(), "::", stringify!($f)),
            $f,
        )
    };
}
