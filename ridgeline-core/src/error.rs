//! Error types for Ridgeline

use crate::blockstore::BlockAddr;
use thiserror::Error;

/// Result type alias for Ridgeline operations
pub type Result<T> = std::result::Result<T, RidgeError>;

/// Ridgeline error types
#[derive(Error, Debug)]
pub enum RidgeError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A block could not be read back intact
    #[error("Storage corruption at {addr}: {reason}")]
    StorageCorruption { addr: BlockAddr, reason: String },

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Every volume is full and the store can't grow
    #[error("Out of space: all {volumes} volumes are full")]
    OutOfSpace { volumes: usize },

    /// The next log volume still holds records that are not checkpointed
    #[error("WAL shard {shard} is saturated, checkpoint required")]
    WalSaturated { shard: usize },

    /// Unknown series
    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    /// Malformed series name
    #[error("Invalid series name: {0}")]
    InvalidSeriesName(String),

    /// Query error
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog could not be loaded or saved
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RidgeError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, RidgeError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RidgeError::StorageCorruption { .. } | RidgeError::ChecksumMismatch { .. }
        )
    }

    /// Resource exhaustion that callers should treat as backpressure
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            RidgeError::OutOfSpace { .. } | RidgeError::WalSaturated { .. }
        )
    }

    pub(crate) fn corruption(addr: BlockAddr, reason: impl Into<String>) -> Self {
        RidgeError::StorageCorruption {
            addr,
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for RidgeError {
    fn from(e: bincode::Error) -> Self {
        RidgeError::InvalidFormat(e.to_string())
    }
}

impl From<serde_json::Error> for RidgeError {
    fn from(e: serde_json::Error) -> Self {
        RidgeError::InvalidFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(RidgeError::OutOfSpace { volumes: 2 }.is_backpressure());
        assert!(RidgeError::WalSaturated { shard: 0 }.is_backpressure());
        assert!(RidgeError::corruption(BlockAddr::new(1, 7), "bad crc").is_corruption());

        let io = RidgeError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_backpressure());
    }
}
