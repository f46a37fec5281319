//! Bit-level I/O for the leaf codec

/// MSB-first bit writer
#[derive(Debug, Default)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    /// Create with capacity hint
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            current: 0,
            used: 0,
        }
    }

    /// Write a single bit
    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u64, 1);
    }

    /// Write the low `num_bits` bits of `value`, most significant first
    pub fn write_bits(&mut self, value: u64, mut num_bits: usize) {
        debug_assert!(num_bits <= 64);
        while num_bits > 0 {
            let free = (8 - self.used) as usize;
            let take = free.min(num_bits);
            let shift = num_bits - take;
            let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;
            self.current |= chunk << (free - take);
            self.used += take as u8;
            num_bits -= take;
            if self.used == 8 {
                self.buffer.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    /// Finish writing and return the buffer
    pub fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.buffer.push(self.current);
        }
        self.buffer
    }

    /// Current size in bytes, counting a partially filled byte
    pub fn len(&self) -> usize {
        self.buffer.len() + (self.used > 0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// MSB-first bit reader
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read a single bit
    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    /// Read `num_bits` bits as a u64
    pub fn read_bits(&mut self, mut num_bits: usize) -> Option<u64> {
        debug_assert!(num_bits <= 64);
        if self.position + num_bits > self.data.len() * 8 {
            return None;
        }
        let mut value = 0u64;
        while num_bits > 0 {
            let byte = self.data[self.position / 8];
            let offset = self.position % 8;
            let avail = 8 - offset;
            let take = avail.min(num_bits);
            let chunk = (byte >> (avail - take)) & (((1u16 << take) - 1) as u8);
            value = (value << take) | chunk as u64;
            self.position += take;
            num_bits -= take;
        }
        Some(value)
    }

    /// Position in bits
    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_widths() {
        let mut writer = BitWriter::default();
        writer.write_bit(true);
        writer.write_bits(0b10101, 5);
        writer.write_bits(0xABCD, 16);
        writer.write_bits(u64::MAX, 64);
        writer.write_bits(0, 3);
        assert_eq!(writer.len(), 12);

        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bits(5), Some(0b10101));
        assert_eq!(reader.read_bits(16), Some(0xABCD));
        assert_eq!(reader.read_bits(64), Some(u64::MAX));
        assert_eq!(reader.read_bits(3), Some(0));
        assert_eq!(reader.position(), 89);
    }

    #[test]
    fn test_read_past_end() {
        let mut reader = BitReader::new(&[0xff]);
        assert_eq!(reader.read_bits(6), Some(0b111111));
        assert_eq!(reader.read_bits(3), None);
        assert_eq!(reader.read_bits(2), Some(0b11));
        assert_eq!(reader.read_bit(), None);
    }
}
