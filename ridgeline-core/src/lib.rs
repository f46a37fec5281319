//! Ridgeline Core - Time-Series Storage and Ingestion Engine
//!
//! Samples are `(series, timestamp, value)` triples. Each series owns an
//! append-only indexed tree whose nodes live in fixed-size blocks.
//!
//! # Architecture
//!
//! - **Block Store**: checksummed 4 KiB blocks allocated across rotating volumes
//! - **NBTree**: per-series tree of compressed leaves and rollup-carrying inner nodes
//! - **WAL (Write-Ahead Log)**: sharded, rotating log replayed after a crash
//! - **Registry**: series name to ParamId mapping, tree ownership and the catalog
//! - **Query**: pull-based read operations feeding a chain of pipeline stages

pub mod blockstore;
pub mod compression;
pub mod nbtree;
pub mod query;
pub mod registry;
pub mod storage;
pub mod wal;

mod error;
mod fsutil;
pub mod memsize;
mod types;

pub use error::{Result, RidgeError};
pub use types::*;

/// Ridgeline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Volumes created by a fresh database
    pub const DEFAULT_VOLUMES: usize = 4;

    /// Volume size (256MB)
    pub const DEFAULT_VOLUME_SIZE: u64 = 256 * 1024 * 1024;

    /// Children per inner node before it is sealed
    pub const TREE_FANOUT: usize = 32;

    /// Tail samples buffered per series before a leaf is written
    pub const TAIL_CAPACITY: usize = 1000;

    /// WAL volumes per shard
    pub const WAL_VOLUMES: usize = 4;

    /// WAL volume size (16MB)
    pub const WAL_VOLUME_SIZE: u64 = 16 * 1024 * 1024;

    /// Interval of the background checkpointer
    pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
}
