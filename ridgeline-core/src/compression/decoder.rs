//! Gorilla decoder for sample runs

use super::bitstream::BitReader;
use crate::{Result, RidgeError, Timestamp, Value};

/// Streaming decoder over a compressed run
pub struct GorillaDecoder<'a> {
    reader: BitReader<'a>,
    count: usize,
    decoded: usize,

    prev_timestamp: Timestamp,
    prev_delta: i64,

    prev_bits: u64,
    window: (u32, u32),
}

impl<'a> GorillaDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev_timestamp: 0,
            prev_delta: 0,
            prev_bits: 0,
            window: (0, 0),
        }
    }

    /// Decode all remaining samples
    pub fn decode_all(&mut self) -> Result<Vec<(Timestamp, Value)>> {
        let mut out = Vec::with_capacity(self.count - self.decoded);
        while let Some(pair) = self.decode_next()? {
            out.push(pair);
        }
        Ok(out)
    }

    /// Decode the next timestamp-value pair
    pub fn decode_next(&mut self) -> Result<Option<(Timestamp, Value)>> {
        if self.decoded >= self.count {
            return Ok(None);
        }

        let is_integer = self.bit()?;
        let (timestamp, bits) = if self.decoded == 0 {
            (self.bits(64)?, self.bits(64)?)
        } else {
            (self.decode_timestamp()?, self.decode_value()?)
        };
        self.prev_timestamp = timestamp;
        self.prev_bits = bits;
        self.decoded += 1;

        Ok(Some((timestamp, Value::from_raw(is_integer, bits))))
    }

    fn decode_timestamp(&mut self) -> Result<Timestamp> {
        let dod = if !self.bit()? {
            0
        } else if !self.bit()? {
            self.bits(7)? as i64 - 63
        } else if !self.bit()? {
            self.bits(9)? as i64 - 255
        } else if !self.bit()? {
            self.bits(12)? as i64 - 2047
        } else {
            self.bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(dod);
        self.prev_delta = delta;
        Ok(self.prev_timestamp.wrapping_add(delta as u64))
    }

    fn decode_value(&mut self) -> Result<u64> {
        if !self.bit()? {
            return Ok(self.prev_bits);
        }

        if self.bit()? {
            let leading = self.bits(5)? as u32;
            let meaningful = match self.bits(6)? as u32 {
                0 => 64,
                m => m,
            };
            if leading + meaningful > 64 {
                return Err(RidgeError::Compression(format!(
                    "invalid value window {}+{}",
                    leading, meaningful
                )));
            }
            self.window = (leading, 64 - leading - meaningful);
        }

        let (leading, trailing) = self.window;
        let meaningful = 64 - leading - trailing;
        let xor = self.bits(meaningful as usize)? << trailing;
        Ok(self.prev_bits ^ xor)
    }

    fn bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| RidgeError::Compression("unexpected end of run".into()))
    }

    fn bits(&mut self, n: usize) -> Result<u64> {
        self.reader
            .read_bits(n)
            .ok_or_else(|| RidgeError::Compression("unexpected end of run".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::GorillaEncoder;

    #[test]
    fn test_mixed_types_and_late_timestamps() {
        let input: Vec<(Timestamp, Value)> = vec![
            (1000, Value::Float(20.5)),
            (2000, Value::Integer(7)),
            (1500, Value::Float(-0.0)),
            (1500, Value::Float(f64::MAX)),
            (u64::MAX, Value::Integer(i64::MIN)),
            (0, Value::Float(1e-300)),
            (10, Value::Integer(-1)),
        ];

        let mut encoder = GorillaEncoder::new();
        for (ts, v) in &input {
            encoder.encode(*ts, *v);
        }
        let run = encoder.finish();

        let decoded = GorillaDecoder::new(&run.data, run.count).decode_all().unwrap();
        assert_eq!(decoded.len(), input.len());
        for ((ts, v), (dts, dv)) in input.iter().zip(decoded.iter()) {
            assert_eq!(ts, dts);
            assert_eq!(v.to_raw(), dv.to_raw());
        }
    }

    #[test]
    fn test_truncated_run() {
        let mut encoder = GorillaEncoder::new();
        for i in 0..10u64 {
            encoder.encode(i * 7, Value::Float(i as f64 * 1.1));
        }
        let run = encoder.finish();
        let cut = &run.data[..run.data.len() / 2];
        let result = GorillaDecoder::new(cut, run.count).decode_all();
        assert!(matches!(result, Err(RidgeError::Compression(_))));
    }
}
