//! Leaf payload compression
//!
//! Sample runs are stored with the scheme from Facebook's paper
//! "Gorilla: A Fast, Scalable, In-Memory Time Series Database":
//! delta-of-delta timestamps and XOR-ed values. Each sample additionally
//! carries one type bit so integer and float values round-trip exactly.

mod bitstream;
mod decoder;
mod encoder;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::GorillaDecoder;
pub use encoder::GorillaEncoder;

/// Upper bound of the encoded size of a single sample, in bytes.
///
/// 1 type bit + 4 + 64 timestamp bits + 2 + 11 + 64 value bits, rounded up.
pub const MAX_SAMPLE_BYTES: usize = 19;

/// Compressed run of samples
#[derive(Debug, Clone)]
pub struct CompressedRun {
    /// Compressed data
    pub data: Vec<u8>,
    /// Number of samples
    pub count: usize,
}

impl CompressedRun {
    /// Get bytes per sample
    pub fn bytes_per_sample(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.data.len() as f64 / self.count as f64
    }
}
