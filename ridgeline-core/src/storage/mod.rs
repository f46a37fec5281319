//! Storage engine - ties the block store, WAL and registry into a database

mod checkpointer;
mod database;

pub use checkpointer::Checkpointer;
pub use database::{Database, DebugReport, RecoveryReport};

use crate::blockstore::{BlockStoreConfig, StoreMode};
use crate::nbtree::TreeConfig;
use crate::wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database configuration, the `[storage]` table of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the block store and the catalog
    pub path: PathBuf,
    /// Volumes created up front
    pub volumes: usize,
    /// Size of each volume
    #[serde(deserialize_with = "crate::memsize::deserialize")]
    pub volume_size: u64,
    /// Add volumes instead of failing when the last one fills up
    pub expandable: bool,
    /// Write out volume files in full when creating them
    pub allocate: bool,
    /// Samples buffered per series before a leaf is written
    pub tail_capacity: usize,
    /// Children per inner node
    pub fanout: usize,
    /// Seconds between background checkpoints, 0 disables them
    pub checkpoint_interval: u64,
    /// Bytes a read operation formats ahead
    pub read_buffer: usize,
    /// Write-ahead log, disabled when absent. Comes from its own table.
    #[serde(skip)]
    pub wal: Option<WalConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
            volumes: crate::config::DEFAULT_VOLUMES,
            volume_size: crate::config::DEFAULT_VOLUME_SIZE,
            expandable: false,
            allocate: false,
            tail_capacity: crate::config::TAIL_CAPACITY,
            fanout: crate::config::TREE_FANOUT,
            checkpoint_interval: crate::config::CHECKPOINT_INTERVAL.as_secs(),
            read_buffer: crate::query::DEFAULT_READ_BUFFER,
            wal: None,
        }
    }
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_wal(mut self, wal: Option<WalConfig>) -> Self {
        self.wal = wal;
        self
    }

    pub fn block_store(&self) -> BlockStoreConfig {
        BlockStoreConfig {
            volumes: self.volumes,
            volume_size: self.volume_size,
            mode: if self.expandable {
                StoreMode::Expandable
            } else {
                StoreMode::Fixed
            },
            allocate: self.allocate,
        }
    }

    pub fn tree(&self) -> TreeConfig {
        TreeConfig {
            tail_capacity: self.tail_capacity,
            fanout: self.fanout,
        }
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval > 0).then(|| Duration::from_secs(self.checkpoint_interval))
    }

    pub(crate) fn blocks_dir(&self) -> PathBuf {
        self.path.join("blocks")
    }

    pub(crate) fn catalog_dir(&self) -> PathBuf {
        self.path.join("catalog")
    }

    pub(crate) fn wal_dir(&self) -> Option<&Path> {
        self.wal.as_ref().map(|w| w.dir.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_sizes() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"path": "/tmp/db", "volume_size": "64MB", "expandable": true}"#)
                .unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/db"));
        assert_eq!(config.volume_size, 64 * 1024 * 1024);
        assert_eq!(config.block_store().mode, StoreMode::Expandable);
        assert_eq!(config.volumes, crate::config::DEFAULT_VOLUMES);
        assert!(config.wal.is_none());

        let config: DatabaseConfig = serde_json::from_str(r#"{"checkpoint_interval": 0}"#).unwrap();
        assert!(config.checkpoint_interval().is_none());
    }
}
