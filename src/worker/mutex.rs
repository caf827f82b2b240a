//! FIFO mutex guarding the single embedded connection.
//!
//! SQLite tolerates one live connection/transaction at a time, so every
//! command that touches the database runs while holding this lock. Waiters
//! are served strictly in arrival order (tokio's mutex queues waiters FIFO);
//! release happens when the [`ConnectionGuard`] is dropped, which covers
//! every exit path including `?` returns and panics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::error::{WorkerError, WorkerResult};

/// Exclusive access token for the connection. Dropping it hands the
/// connection to the next waiter.
#[derive(Debug)]
pub struct ConnectionGuard {
    _inner: OwnedMutexGuard<()>,
}

/// FIFO async lock over the logical connection.
#[derive(Debug, Clone)]
pub struct ConnectionMutex {
    inner: Arc<Mutex<()>>,
    timeout: Option<Duration>,
}

impl Default for ConnectionMutex {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConnectionMutex {
    /// Create a mutex. With `Some(timeout)`, acquisition fails with
    /// [`WorkerError::MutexTimeout`] instead of waiting forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            timeout,
        }
    }

    /// Wait until every earlier waiter has released, then take the lock.
    pub async fn acquire(&self) -> WorkerResult<ConnectionGuard> {
        let lock = self.inner.clone().lock_owned();
        let guard = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, lock)
                .await
                .map_err(|_| WorkerError::MutexTimeout(limit))?,
            None => lock.await,
        };
        Ok(ConnectionGuard { _inner: guard })
    }

    /// Whether some caller currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
