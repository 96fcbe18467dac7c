//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hrm_core::{ConnectionConfig, ManagerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Devices `monitor` connects to when none are given on the command line
    pub devices: Vec<String>,

    /// Capacity of the manager's event queue
    pub event_capacity: usize,

    /// Connection timing
    pub connection: ConnectionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            event_capacity: ManagerConfig::default().event_capacity,
            connection: ConnectionSettings::default(),
        }
    }
}

/// Per-connection timing, all durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub settle_delay_ms: u64,
    pub recovery_disconnect_pause_ms: u64,
    pub recovery_reopen_pause_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub max_recovery_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            settle_delay_ms: millis(defaults.settle_delay),
            recovery_disconnect_pause_ms: millis(defaults.recovery_disconnect_pause),
            recovery_reopen_pause_ms: millis(defaults.recovery_reopen_pause),
            disconnect_timeout_ms: millis(defaults.disconnect_timeout),
            connect_timeout_ms: millis(defaults.connect_timeout),
            operation_timeout_ms: millis(defaults.operation_timeout),
            max_recovery_attempts: defaults.max_recovery_attempts,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ConnectionSettings {
    /// Convert into the core connection configuration.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .settle_delay(Duration::from_millis(self.settle_delay_ms))
            .recovery_pauses(
                Duration::from_millis(self.recovery_disconnect_pause_ms),
                Duration::from_millis(self.recovery_reopen_pause_ms),
            )
            .disconnect_timeout(Duration::from_millis(self.disconnect_timeout_ms))
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .operation_timeout(Duration::from_millis(self.operation_timeout_ms))
            .max_recovery_attempts(self.max_recovery_attempts)
    }
}

impl Config {
    /// Default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hrm")
            .join("config.toml")
    }

    /// Load and validate config from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default config file, or defaults if it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load from an explicit path if given, otherwise the default location.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    /// Save config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(blank) = self.devices.iter().find(|d| d.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "device address must not be blank: {:?}",
                blank
            )));
        }
        self.manager_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Convert into the core manager configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::new()
            .connection(self.connection.to_connection_config())
            .event_capacity(self.event_capacity)
    }
}
