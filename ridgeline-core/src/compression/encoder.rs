//! Gorilla encoder for sample runs

use super::bitstream::BitWriter;
use super::CompressedRun;
use crate::{Timestamp, Value};

/// Incremental encoder of `(timestamp, value)` pairs
pub struct GorillaEncoder {
    writer: BitWriter,
    count: usize,

    // Timestamp state
    prev_timestamp: Timestamp,
    prev_delta: i64,

    // Value state
    prev_bits: u64,
    window: Option<(u32, u32)>,
}

impl GorillaEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(4096),
            count: 0,
            prev_timestamp: 0,
            prev_delta: 0,
            prev_bits: 0,
            window: None,
        }
    }

    /// Encode a timestamp-value pair
    pub fn encode(&mut self, timestamp: Timestamp, value: Value) {
        let (is_integer, bits) = value.to_raw();
        self.writer.write_bit(is_integer);
        if self.count == 0 {
            self.writer.write_bits(timestamp, 64);
            self.writer.write_bits(bits, 64);
            self.prev_timestamp = timestamp;
            self.prev_bits = bits;
        } else {
            self.encode_timestamp(timestamp);
            self.encode_value(bits);
        }
        self.count += 1;
    }

    /// Number of encoded samples
    pub fn count(&self) -> usize {
        self.count
    }

    /// Encoded size so far in bytes
    pub fn len(&self) -> usize {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finish encoding and return the compressed run
    pub fn finish(self) -> CompressedRun {
        CompressedRun {
            data: self.writer.finish(),
            count: self.count,
        }
    }

    fn encode_timestamp(&mut self, timestamp: Timestamp) {
        // Late writes make deltas negative, wrapping arithmetic keeps them exact.
        let delta = timestamp.wrapping_sub(self.prev_timestamp) as i64;
        let dod = delta.wrapping_sub(self.prev_delta);

        if dod == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&dod) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((dod + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_timestamp = timestamp;
    }

    fn encode_value(&mut self, bits: u64) {
        let xor = bits ^ self.prev_bits;
        self.prev_bits = bits;

        if xor == 0 {
            self.writer.write_bit(false);
            return;
        }
        self.writer.write_bit(true);

        let leading = xor.leading_zeros().min(31);
        let trailing = xor.trailing_zeros();

        match self.window {
            Some((prev_leading, prev_trailing))
                if leading >= prev_leading && trailing >= prev_trailing =>
            {
                self.writer.write_bit(false);
                let meaningful = 64 - prev_leading - prev_trailing;
                self.writer.write_bits(xor >> prev_trailing, meaningful as usize);
            }
            _ => {
                self.writer.write_bit(true);
                let meaningful = 64 - leading - trailing;
                self.writer.write_bits(leading as u64, 5);
                // 64 doesn't fit in six bits, it is stored as 0
                self.writer.write_bits((meaningful & 63) as u64, 6);
                self.writer.write_bits(xor >> trailing, meaningful as usize);
                self.window = Some((leading, trailing));
            }
        }
    }
}

impl Default for GorillaEncoder {
    fn default() -> Self {
        Self::new()
    }
}
