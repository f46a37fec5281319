//! Block store
//!
//! Fixed-size blocks allocated append-only across a rotating set of
//! pre-allocated volumes:
//! - **Volume**: one file of `capacity` blocks with a write cursor
//! - **BlockStore**: allocation, checksummed block I/O, rotation and the
//!   persisted cursor metadata

mod block;
mod store;
mod volume;

pub use block::{decode_block, encode_block, BLOCK_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use store::{BlockStore, BlockStoreStats, VolumeStats};
pub use volume::Volume;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a block: volume index plus block offset inside the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr {
    pub volume: u32,
    pub offset: u32,
}

impl BlockAddr {
    pub fn new(volume: u32, offset: u32) -> Self {
        Self { volume, offset }
    }

    /// Packed form used inside node payloads
    pub fn to_u64(self) -> u64 {
        ((self.volume as u64) << 32) | self.offset as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            volume: (raw >> 32) as u32,
            offset: raw as u32,
        }
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}", self.volume, self.offset)
    }
}

/// What happens when the last volume fills up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Fixed total capacity, allocation fails with `OutOfSpace`
    #[default]
    Fixed,
    /// A new volume is created
    Expandable,
}

/// Block store configuration
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Number of volumes created up front
    pub volumes: usize,
    /// Volume size in bytes, rounded down to whole blocks
    pub volume_size: u64,
    /// Growth policy
    pub mode: StoreMode,
    /// Write zeros over the whole volume instead of creating a sparse file
    pub allocate: bool,
}

impl BlockStoreConfig {
    /// Volume capacity in blocks
    pub fn capacity_blocks(&self) -> u32 {
        (self.volume_size / crate::config::BLOCK_SIZE as u64).min(u32::MAX as u64) as u32
    }
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            volumes: crate::config::DEFAULT_VOLUMES,
            volume_size: crate::config::DEFAULT_VOLUME_SIZE,
            mode: StoreMode::Fixed,
            allocate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_packing() {
        let addr = BlockAddr::new(3, 0xdead_beef);
        assert_eq!(BlockAddr::from_u64(addr.to_u64()), addr);
        assert_eq!(addr.to_string(), "v3:3735928559");
        assert!(BlockAddr::new(1, 9) < BlockAddr::new(2, 0));
    }
}
