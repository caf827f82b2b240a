//! # chatstats
//!
//! Local data-access layer for chat-backup analytics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           Analytics queries (cached via Cached)          │
//! └─────────────────────────────────────────────────────────┘
//!            │ miss                        ▲ hit
//!            ▼                             │
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ WorkerDriver             │   │ ResultCache              │
//! │ (mutex, request ids)     │   │ (namespace + epoch)      │
//! └──────────────────────────┘   └──────────────────────────┘
//!            │ NDJSON frames               │
//!            ▼                             ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ Worker thread + Engine   │   │ CacheStore               │
//! │ (one SQLite database)    │   │ (SQLite file / memory)   │
//! └──────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! Backup statements enter through the [`loader`]; [`session`] ties the
//! pieces together and keeps the cache epoch in step with the database.

pub mod cache;
pub mod config;
pub mod loader;
pub mod session;
pub mod worker;

pub use cache::{Cached, ResultCache};
pub use config::Settings;
pub use loader::{load_database, BulkLoader, LoadError, LoadReport};
pub use session::{AnalyticsSession, SessionError};
pub use worker::{CompiledQuery, DriverConfig, WorkerDriver, WorkerError};
