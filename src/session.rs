//! One analytics session: driver, bulk loader and result cache wired together.
//!
//! The session keeps the cache epoch in step with the loaded database: after
//! opening and after every import it fingerprints the database and lets the
//! cache drop everything computed against other data.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheError, Cached, ResultCache};
use crate::config::{Settings, SettingsError};
use crate::loader::{BulkLoader, LoadError, LoadReport};
use crate::worker::{DriverConfig, WorkerDriver, WorkerError};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] SettingsError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

pub struct AnalyticsSession {
    driver: Arc<WorkerDriver>,
    cache: Arc<ResultCache>,
}

impl AnalyticsSession {
    /// Build cache and driver from settings, start the worker and sync the
    /// cache epoch with whatever database is already there.
    pub async fn open(settings: &Settings) -> SessionResult<Self> {
        let cache = ResultCache::from_settings(settings)?;
        let driver = WorkerDriver::new(DriverConfig::from_settings(settings)?);
        Self::with_parts(driver, cache).await
    }

    /// Like [`open`](Self::open) with a ready-made driver and cache.
    pub async fn with_parts(driver: WorkerDriver, cache: ResultCache) -> SessionResult<Self> {
        driver.init().await?;
        let session = Self {
            driver: Arc::new(driver),
            cache: Arc::new(cache),
        };
        session.refresh_epoch().await?;
        info!(durable = session.driver.is_durable(), "session: opened");
        Ok(session)
    }

    pub fn driver(&self) -> &Arc<WorkerDriver> {
        &self.driver
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Load a decoded backup, then rotate the cache epoch.
    ///
    /// A failed load leaves the database partially written; the epoch is
    /// still refreshed so no result from before the import survives.
    pub async fn import(
        &self,
        statements: Vec<String>,
        on_progress: impl FnMut(u8),
    ) -> SessionResult<LoadReport> {
        let loaded = BulkLoader::new(&self.driver)
            .load(statements, on_progress)
            .await;

        match loaded {
            Ok(report) => {
                self.refresh_epoch().await?;
                info!(applied = report.statements_applied, "session: import finished");
                Ok(report)
            }
            Err(err) => {
                if let Err(refresh) = self.refresh_epoch().await {
                    warn!(error = %refresh, "session: epoch refresh after failed import failed");
                }
                Err(err.into())
            }
        }
    }

    /// Fingerprint the database and hand the epoch to the cache. Returns
    /// whether the cache was cleared.
    pub async fn refresh_epoch(&self) -> SessionResult<bool> {
        let epoch = self.driver.database_epoch().await?;
        Ok(self.cache.observe_epoch(&epoch)?)
    }

    /// Wrap `f` with the session cache under `identity`.
    pub fn cached<F>(&self, identity: impl Into<String>, f: F) -> Cached<F> {
        Cached::new(self.cache.clone(), identity, f)
    }

    /// Stop the worker. The cache stays usable for `has_cache_for` lookups.
    pub async fn close(&self) -> SessionResult<()> {
        self.driver.destroy().await?;
        info!("session: closed");
        Ok(())
    }
}
