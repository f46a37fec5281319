//! WAL record and volume header formats

use crate::{ParamId, Result, RidgeError, SequenceNumber, Timestamp, Value};
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Encoded size of one record
pub const RECORD_SIZE: usize = 8 + 8 + 8 + 1 + 8 + 4;

/// Encoded size of a volume header
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 16;

const MAGIC: &[u8; 4] = b"RWAL";
const VERSION: u32 = 1;

/// A single logged sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalRecord {
    pub seq: SequenceNumber,
    pub param_id: ParamId,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl WalRecord {
    /// Serialize the record with its CRC checksum
    ///
    /// Format:
    /// - 8 bytes: sequence number
    /// - 8 bytes: param id
    /// - 8 bytes: timestamp
    /// - 1 byte: value tag (1 = integer)
    /// - 8 bytes: value bits
    /// - 4 bytes: CRC32 of everything above
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = Vec::with_capacity(RECORD_SIZE);
        let (is_integer, bits) = self.value.to_raw();
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.param_id);
        buf.put_u64_le(self.timestamp);
        buf.put_u8(is_integer as u8);
        buf.put_u64_le(bits);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        let mut out = [0u8; RECORD_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Deserialize a record, validating its checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE {
            return Err(RidgeError::InvalidFormat("WAL record too short".into()));
        }
        let body = &data[..RECORD_SIZE - 4];
        let expected = (&data[RECORD_SIZE - 4..RECORD_SIZE]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(RidgeError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let seq = cursor.get_u64_le();
        let param_id = cursor.get_u64_le();
        let timestamp = cursor.get_u64_le();
        let tag = cursor.get_u8();
        if tag > 1 {
            return Err(RidgeError::InvalidFormat(format!("bad value tag {}", tag)));
        }
        let bits = cursor.get_u64_le();
        Ok(Self {
            seq,
            param_id,
            timestamp,
            value: Value::from_raw(tag == 1, bits),
        })
    }
}

/// Identity stamped at the start of every log volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHeader {
    pub shard: u32,
    pub db_id: Uuid,
}

impl VolumeHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u32_le(VERSION);
        buf.put_u32_le(self.shard);
        buf.put_slice(self.db_id.as_bytes());

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE || &data[..4] != MAGIC {
            return Err(RidgeError::InvalidFormat("not a WAL volume".into()));
        }
        let mut cursor = &data[4..HEADER_SIZE];
        let version = cursor.get_u32_le();
        if version != VERSION {
            return Err(RidgeError::InvalidFormat(format!(
                "unsupported WAL version {}",
                version
            )));
        }
        let shard = cursor.get_u32_le();
        let mut id = [0u8; 16];
        cursor.copy_to_slice(&mut id);
        Ok(Self {
            shard,
            db_id: Uuid::from_bytes(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_checksum() {
        let record = WalRecord {
            seq: 42,
            param_id: 7,
            timestamp: 1_700_000_000,
            value: Value::Integer(-3),
        };
        let mut raw = record.encode();
        assert_eq!(WalRecord::decode(&raw).unwrap(), record);

        raw[20] ^= 0x01;
        assert!(matches!(
            WalRecord::decode(&raw),
            Err(RidgeError::ChecksumMismatch { .. })
        ));
        assert!(WalRecord::decode(&raw[..10]).is_err());
    }

    #[test]
    fn test_header() {
        let header = VolumeHeader {
            shard: 3,
            db_id: Uuid::new_v4(),
        };
        assert_eq!(VolumeHeader::decode(&header.encode()).unwrap(), header);
        assert!(VolumeHeader::decode(b"garbage that is long enough......").is_err());
    }
}
