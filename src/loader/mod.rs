//! Bulk loading of backup statements.
//!
//! The backup decoder hands over an ordered list of SQL statements. The
//! loader ships them to the worker in a single `LoadBulk` command and relays
//! whole-percent progress back to the caller.
//!
//! A failed load is not rolled back: statements before the failing one stay
//! applied, so the database is in an indeterminate state and the caller
//! should reload from scratch.
//!
//! # Example
//!
//! ```ignore
//! use chatstats::loader::BulkLoader;
//!
//! let report = BulkLoader::new(&driver)
//!     .load(statements, |percent| println!("{percent}%"))
//!     .await?;
//! ```

mod progress;

pub use progress::ProgressThrottle;
pub(crate) use progress::ProgressReporter;

use thiserror::Error;

use crate::worker::{WorkerDriver, WorkerError};

/// Result type for bulk loads.
pub type LoadResult<T> = Result<T, LoadError>;

/// A failed bulk load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The engine rejected statement `index` (0-based).
    #[error("bulk load failed at statement {index}")]
    Statement {
        index: usize,
        #[source]
        source: WorkerError,
    },

    /// The load could not run or the worker went away.
    #[error("bulk load failed")]
    Worker(#[source] WorkerError),
}

impl LoadError {
    /// Index of the failing statement, if the engine reported one.
    pub fn statement_index(&self) -> Option<usize> {
        match self {
            Self::Statement { index, .. } => Some(*index),
            Self::Worker(_) => None,
        }
    }

    /// The underlying worker/engine error.
    pub fn worker_error(&self) -> &WorkerError {
        match self {
            Self::Statement { source, .. } | Self::Worker(source) => source,
        }
    }
}

impl From<WorkerError> for LoadError {
    fn from(err: WorkerError) -> Self {
        match err.statement_index() {
            Some(index) => Self::Statement { index, source: err },
            None => Self::Worker(err),
        }
    }
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub total: usize,
    pub statements_applied: usize,
}

/// Feeds statement batches into the worker.
pub struct BulkLoader<'a> {
    driver: &'a WorkerDriver,
}

impl<'a> BulkLoader<'a> {
    pub fn new(driver: &'a WorkerDriver) -> Self {
        Self { driver }
    }

    /// Apply `statements` in order. `on_progress` sees strictly increasing
    /// whole percentages and, on success, a final 100.
    pub async fn load(
        &self,
        statements: Vec<String>,
        on_progress: impl FnMut(u8),
    ) -> LoadResult<LoadReport> {
        let total = statements.len();
        let mut reporter = ProgressReporter::new(on_progress);

        let applied = self
            .driver
            .load_bulk(statements, |percent| reporter.report(percent))
            .await?;
        reporter.finish();

        Ok(LoadReport {
            total,
            statements_applied: applied,
        })
    }

    /// Apply `statements` without progress reporting.
    pub async fn load_silently(&self, statements: Vec<String>) -> LoadResult<LoadReport> {
        self.load(statements, |_| {}).await
    }
}

/// Shorthand for [`BulkLoader::load`].
pub async fn load_database(
    driver: &WorkerDriver,
    statements: Vec<String>,
    on_progress: impl FnMut(u8),
) -> LoadResult<LoadReport> {
    BulkLoader::new(driver).load(statements, on_progress).await
}
