//! Worker communication module.
//!
//! The embedded SQLite engine runs on a dedicated thread. The rest of the
//! application talks to it only through [`WorkerDriver`], which turns every
//! operation into a plain-data command frame and awaits the matching event.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Application (Tokio tasks)                    │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                 WorkerDriver (async)                   │  │
//! │  │  - FIFO connection mutex                               │  │
//! │  │  - request ids, pending-call table, reader task        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │              commands (NDJSON) │ ▲ events (NDJSON)           │
//! └────────────────────────────────┼─┼───────────────────────────┘
//!                                  ▼ │
//! ┌──────────────────────────────────────────────────────────────┐
//! │            Worker thread: host::serve + Engine               │
//! │  - one open database at a time                               │
//! │  - exactly one terminal event per command                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use chatstats::worker::{CompiledQuery, DriverConfig, WorkerDriver};
//! use futures::TryStreamExt;
//!
//! let driver = WorkerDriver::new(DriverConfig::in_memory());
//! driver.init().await?;
//!
//! let counts = driver
//!     .execute(&CompiledQuery::raw("SELECT count(*) AS n FROM message"))
//!     .await?;
//!
//! let batches: Vec<_> = driver
//!     .stream(&CompiledQuery::raw("SELECT * FROM message"))
//!     .await?
//!     .try_collect()
//!     .await?;
//!
//! driver.destroy().await?;
//! ```

mod client;
pub mod engine;
mod error;
pub mod host;
mod mutex;
pub mod protocol;
mod query;
mod stream;
pub mod transport;

pub use client::{ConnectionLease, DriverConfig, WorkerDriver, DEFAULT_FILE_NAME};
pub use error::{WorkerError, WorkerResult};
pub use mutex::{ConnectionGuard, ConnectionMutex};
pub use protocol::{RowBatch, RowSet, SqlValue, DEFAULT_STREAM_WINDOW};
pub use query::{CompiledQuery, QueryKind};
pub use stream::RowStream;
pub use transport::{WorkerEndpoint, WorkerTransport};
