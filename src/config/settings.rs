//! TOML-based configuration for chatstats.
//!
//! Supports a config file (chatstats.toml) with environment variable expansion
//! in path values.
//!
//! Example configuration:
//! ```toml
//! [database]
//! file_name = "signal.sqlite"
//! data_dir = "${XDG_DATA_HOME}/chatstats"
//! durable = true
//!
//! [worker]
//! request_timeout_secs = 30
//! lock_timeout_ms = 5000
//! stream_window = 64
//!
//! [cache]
//! enabled = true
//! persistent = true
//! path = "$HOME/.chatstats/cache.db"
//! namespace = "database"
//! quota_bytes = 5242880
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::DEFAULT_STREAM_WINDOW;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CHATSTATS_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Embedded database location.
    pub database: DatabaseSettings,

    /// Worker round-trip and locking limits.
    pub worker: WorkerSettings,

    /// Result cache configuration.
    pub cache: CacheSettings,
}

/// Embedded database configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file name inside `data_dir`.
    pub file_name: String,

    /// Directory for the database file (supports `${ENV_VAR}` expansion).
    /// Defaults to the platform data directory.
    pub data_dir: Option<String>,

    /// Request durable storage; falls back to memory if refused.
    pub durable: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            file_name: "signal.sqlite".to_string(),
            data_dir: None,
            durable: true,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Timeout for init/close round trips in seconds; 0 disables it.
    pub request_timeout_secs: u64,

    /// Timeout for acquiring the connection in milliseconds; unset waits
    /// forever.
    pub lock_timeout_ms: Option<u64>,

    /// Rows a stream may run ahead of its consumer.
    pub stream_window: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            lock_timeout_ms: None,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }
}

impl WorkerSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Enable result caching.
    pub enabled: bool,

    /// Keep results on disk (SQLite) instead of in memory.
    pub persistent: bool,

    /// Cache database path (supports `${ENV_VAR}` expansion).
    /// Defaults to `~/.chatstats/cache.db`.
    pub path: Option<String>,

    /// Key namespace cleared on every epoch change.
    pub namespace: String,

    /// Byte limit for stored keys plus values.
    pub quota_bytes: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            persistent: true,
            path: None,
            namespace: "database".to_string(),
            quota_bytes: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `CHATSTATS_CONFIG`
    /// 2. `./chatstats.toml`
    /// 3. `~/.config/chatstats/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("chatstats.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("chatstats").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let file_name = &self.database.file_name;
        if file_name.is_empty() {
            return Err(SettingsError::InvalidConfig(
                "database.file_name must not be empty".to_string(),
            ));
        }
        if file_name.contains(['/', '\\']) {
            return Err(SettingsError::InvalidConfig(format!(
                "database.file_name must be a bare file name, got '{file_name}'"
            )));
        }
        if self.cache.namespace.is_empty() {
            return Err(SettingsError::InvalidConfig(
                "cache.namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured database directory with environment variables expanded.
    pub fn data_dir(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.database
            .data_dir
            .as_deref()
            .map(|dir| expand_env_vars(dir).map(PathBuf::from))
            .transpose()
    }

    /// The configured cache path with environment variables expanded.
    pub fn cache_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.cache
            .path
            .as_deref()
            .map(|path| expand_env_vars(path).map(PathBuf::from))
            .transpose()
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // lone $
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
