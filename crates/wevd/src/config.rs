//! Server configuration.
//!
//! Settings come from three layers, later ones winning:
//! 1. Built-in defaults
//! 2. An optional TOML file (`wevd serve --config wev.toml`)
//! 3. The `WEV_BIND` environment variable and CLI flags
//!
//! ```toml
//! bind = "0.0.0.0:9000"
//! max_connections = 512
//! max_message_size = 65536
//! write_timeout_secs = 5
//! id_max_attempts = 16
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Environment variable overriding the listen address.
pub const BIND_ENV: &str = "WEV_BIND";

/// Maximum inbound frame size (1 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Write timeout for one outbound frame.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,

    /// Registry capacity; further connections are refused
    pub max_connections: usize,

    /// Inbound frames larger than this many bytes are dropped
    pub max_message_size: usize,

    /// Per-frame write timeout in seconds
    pub write_timeout_secs: u64,

    /// Id allocation retry budget
    pub id_max_attempts: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: crate::registry::MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            id_max_attempts: wev_core::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&text)
    }

    /// Applies `WEV_BIND` from the process environment, if set.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        match std::env::var(BIND_ENV) {
            Ok(value) => self.with_bind_str(&value),
            Err(_) => Ok(self),
        }
    }

    /// Overrides the listen address from a string.
    pub fn with_bind_str(mut self, value: &str) -> Result<Self, ConfigError> {
        self.bind = value
            .parse()
            .map_err(|_| ConfigError::InvalidBind(value.to_string()))?;
        Ok(self)
    }

    /// Per-frame write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be at least 1".into()));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid("write_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration errors: config file problems and handler table misuse.
///
/// Reported once, at setup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid bind address: {0}")]
    InvalidBind(String),

    #[error("Event name `{0}` is reserved for a lifecycle hook")]
    ReservedEvent(String),

    #[error("Event `{0}` registered more than once")]
    DuplicateEvent(String),

    #[error("Event name must not be empty")]
    EmptyEventName,
}
