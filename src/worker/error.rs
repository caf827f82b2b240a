//! Worker-specific error types.

use std::io;
use thiserror::Error;

use super::protocol::{codes, ErrorInfo};

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur while talking to the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker thread.
    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to serialize a request frame.
    #[error("failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Malformed or unexpected event from the worker.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The embedded engine rejected a statement.
    #[error("engine error: {message} (code: {code})")]
    Engine {
        /// Error code from the worker.
        code: String,
        /// Native engine message.
        message: String,
        /// Index of the failing statement in a bulk load.
        statement_index: Option<usize>,
    },

    /// Waited too long for the connection mutex.
    #[error("timed out after {0:?} waiting for the connection")]
    MutexTimeout(std::time::Duration),

    /// A round trip did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Operation attempted after `destroy()`, or abandoned by it.
    #[error("driver has been destroyed")]
    Destroyed,

    /// The driver has not completed `init()`.
    #[error("driver is not initialized")]
    NotInitialized,

    /// The operation is not supported for this query.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The worker panicked while running a command. The worker itself keeps
    /// serving.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// Worker thread exited unexpectedly.
    #[error("worker thread exited unexpectedly")]
    WorkerExited,
}

impl WorkerError {
    /// Rebuild an engine error from the error slot of a terminal event.
    pub fn from_info(info: ErrorInfo) -> Self {
        match info.code.as_str() {
            codes::INVALID_REQUEST => Self::Protocol(info.message),
            codes::WORKER_PANIC => Self::WorkerPanicked(info.message),
            _ => Self::Engine {
                code: info.code,
                message: info.message,
                statement_index: info.statement_index,
            },
        }
    }

    /// Index of the failing bulk-load statement, if the engine reported one.
    pub fn statement_index(&self) -> Option<usize> {
        match self {
            Self::Engine {
                statement_index, ..
            } => *statement_index,
            _ => None,
        }
    }

    /// Check if this error indicates the worker is gone.
    pub fn is_worker_gone(&self) -> bool {
        matches!(self, Self::WorkerExited | Self::Destroyed)
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::MutexTimeout(_))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializeFailed(err)
    }
}
