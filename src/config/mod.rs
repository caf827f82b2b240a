//! Configuration module for chatstats.
//!
//! Handles the settings file and environment variable expansion.

mod settings;

pub use settings::{
    expand_env_vars, CacheSettings, DatabaseSettings, Settings, SettingsError, WorkerSettings,
    CONFIG_ENV_VAR,
};
