//! Process configuration.
//!
//! A JSON file (path = first non-flag CLI argument) layered over defaults,
//! then environment overrides. Every field is optional in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::SinkConfig;
use crate::channel::QueuePriority;
use crate::watcher::WatcherConfig;

pub const ENV_REDIS_URL: &str = "SWITCHYARD_REDIS_URL";
pub const ENV_REDIS_PASSWORD: &str = "SWITCHYARD_REDIS_PASSWORD";
pub const ENV_ADMIN_PORT: &str = "SWITCHYARD_ADMIN_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported config format `{0}` (expected .json)")]
    UnsupportedFormat(PathBuf),

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `host:port` or a `redis://` URL.
    pub url: String,
    pub password: Option<String>,
    pub reconnect_backoff_ms: u64,
    /// Upper bound of one blocking pop.
    pub pop_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "localhost:6379".to_string(),
            password: None,
            reconnect_backoff_ms: 1_000,
            pop_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub priority: QueuePriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 250,
        }
    }
}

impl PollSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// SQLite file holding snapshots.
    pub path: PathBuf,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("switchyard-archive.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// `0` disables the HTTP surface.
    pub port: u16,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub store: StoreConfig,
    pub channel: ChannelSettings,
    pub watcher: PollSettings,
    pub sink: PollSettings,
    pub archive: ArchiveSettings,
    pub admin: AdminSettings,
    pub log: LogSettings,
}

impl SwitchyardConfig {
    /// Load from `path` (or defaults when `None`), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Load using the first command-line argument that is not a `--flag`.
    pub fn from_args() -> Result<Self, ConfigError> {
        let path = std::env::args()
            .skip(1)
            .find(|arg| !arg.starts_with("--"))
            .map(PathBuf::from);
        Self::load(path.as_deref())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if !is_json {
            return Err(ConfigError::UnsupportedFormat(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.store.url = url;
        }
        if let Some(password) = lookup(ENV_REDIS_PASSWORD) {
            self.store.password = Some(password);
        }
        if let Some(port) = lookup(ENV_ADMIN_PORT) {
            self.admin.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_ADMIN_PORT,
                value: port,
            })?;
        }
        Ok(())
    }

    /// Settings for a watcher named `name`.
    pub fn watcher_config(&self, name: impl Into<String>) -> WatcherConfig {
        WatcherConfig {
            name: name.into(),
            batch_size: self.watcher.batch_size,
            poll_interval: self.watcher.poll_interval(),
            pop_timeout: self.store.pop_timeout(),
        }
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            batch_size: self.sink.batch_size,
            poll_interval: self.sink.poll_interval(),
        }
    }
}
