//! Daemon configuration
//!
//! Loaded from a TOML file. `[storage]` and `[wal]` configure the database
//! (no `[wal]` table means no write-ahead log), `[server]` the listeners and
//! `[logging]` the subscriber. Environment variables override a few keys.

use ridgeline_core::storage::DatabaseConfig;
use ridgeline_core::wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: DatabaseConfig,

    #[serde(default)]
    pub wal: Option<WalConfig>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration. A listener without an address is off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
    /// Threads reading the UDP socket
    pub udp_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: Some(SocketAddr::from(([0, 0, 0, 0], 8181))),
            tcp: Some(SocketAddr::from(([0, 0, 0, 0], 8282))),
            udp: None,
            udp_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `ridgeline_core=debug`
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `RIDGELINE_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RIDGELINE_DATA_DIR") {
            self.storage.path = PathBuf::from(path);
        }
        if let Ok(addr) = std::env::var("RIDGELINE_HTTP_ADDR") {
            if let Ok(addr) = addr.parse() {
                self.server.http = Some(addr);
            }
        }
        if let Ok(level) = std::env::var("RIDGELINE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Database configuration with the WAL table folded in
    pub fn database(&self) -> DatabaseConfig {
        self.storage.clone().with_wal(self.wal.clone())
    }
}
