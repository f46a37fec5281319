//! Checksummed metadata files installed with write-to-temp + rename

use crate::{Result, RidgeError};
use bytes::{Buf, BufMut};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

const HEADER_SIZE: usize = 4 + 4 + 8 + 4;

/// Write `payload` to `path` atomically.
///
/// Format: 4-byte magic, u32 version, u64 payload length, u32 crc32, payload.
pub(crate) fn write_framed(path: &Path, magic: &[u8; 4], version: u32, payload: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.put_slice(magic);
    header.put_u32_le(version);
    header.put_u64_le(payload.len() as u64);
    header.put_u32_le(crc32fast::hash(payload));

    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?,
    );
    w.write_all(&header)?;
    w.write_all(payload)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)
}

/// Read and validate a file written by [`write_framed`]
pub(crate) fn read_framed(path: &Path, magic: &[u8; 4], version: u32) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE || &data[..4] != magic {
        return Err(RidgeError::InvalidFormat(format!("{:?}: bad header", path)));
    }

    let mut cursor = &data[4..HEADER_SIZE];
    let found_version = cursor.get_u32_le();
    let len = cursor.get_u64_le() as usize;
    let expected = cursor.get_u32_le();

    if found_version != version {
        return Err(RidgeError::InvalidFormat(format!(
            "{:?}: unsupported version {}",
            path, found_version
        )));
    }
    let payload = data
        .get(HEADER_SIZE..HEADER_SIZE + len)
        .ok_or_else(|| RidgeError::InvalidFormat(format!("{:?}: truncated", path)))?;

    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(RidgeError::ChecksumMismatch { expected, actual });
    }
    Ok(payload.to_vec())
}

pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RidgeError::Internal(format!("{:?} has no parent", path)))?;
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_framed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.bin");

        write_framed(&path, b"TEST", 1, b"first").unwrap();
        write_framed(&path, b"TEST", 1, b"second").unwrap();
        assert_eq!(read_framed(&path, b"TEST", 1).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());

        assert!(read_framed(&path, b"NOPE", 1).is_err());
        assert!(read_framed(&path, b"TEST", 2).is_err());

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();
        assert!(matches!(
            read_framed(&path, b"TEST", 1),
            Err(RidgeError::ChecksumMismatch { .. })
        ));
    }
}
