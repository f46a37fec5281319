//! Block framing: checksum and length header, zero padded to the block size

use super::BlockAddr;
use crate::config::BLOCK_SIZE;
use crate::{Result, RidgeError};
use bytes::{Buf, BufMut};

/// Header size in bytes (crc32 + payload length)
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Largest payload that fits in one block
pub const MAX_PAYLOAD_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Frame a payload into a full block image
///
/// Format:
/// - 4 bytes: CRC32 of the length field and payload
/// - 4 bytes: payload length
/// - N bytes: payload
/// - zero padding up to `BLOCK_SIZE`
pub fn encode_block(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(RidgeError::InvalidFormat(format!(
            "block payload of {} bytes exceeds {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(BLOCK_SIZE);
    buf.put_u32_le(0);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);

    let checksum = crc32fast::hash(&buf[4..]);
    buf[0..4].copy_from_slice(&checksum.to_le_bytes());
    buf.resize(BLOCK_SIZE, 0);
    Ok(buf)
}

/// Validate a block image and return its payload
pub fn decode_block(addr: BlockAddr, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < BLOCK_HEADER_SIZE {
        return Err(RidgeError::corruption(addr, "short block"));
    }

    let mut cursor = raw;
    let expected = cursor.get_u32_le();
    let len = cursor.get_u32_le() as usize;
    if len > MAX_PAYLOAD_SIZE || BLOCK_HEADER_SIZE + len > raw.len() {
        return Err(RidgeError::corruption(
            addr,
            format!("payload length {} out of bounds", len),
        ));
    }

    let actual = crc32fast::hash(&raw[4..BLOCK_HEADER_SIZE + len]);
    if expected != actual {
        return Err(RidgeError::corruption(
            addr,
            format!("checksum mismatch: expected {}, got {}", expected, actual),
        ));
    }

    Ok(raw[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_frame() {
        let block = encode_block(b"leaf payload").unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        let payload = decode_block(BlockAddr::new(0, 0), &block).unwrap();
        assert_eq!(payload, b"leaf payload");
    }

    #[test]
    fn test_zeroed_block_is_corrupt() {
        // A never-written block reads back as zeros: length 0, crc 0 != crc("\0\0\0\0")
        let zeros = vec![0u8; BLOCK_SIZE];
        let err = decode_block(BlockAddr::new(0, 1), &zeros).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_bit_flip_detected() {
        let mut block = encode_block(&[7u8; 100]).unwrap();
        block[50] ^= 0x01;
        assert!(decode_block(BlockAddr::new(2, 5), &block).unwrap_err().is_corruption());
    }

    #[test]
    fn test_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(encode_block(&payload), Err(RidgeError::InvalidFormat(_))));
    }
}
