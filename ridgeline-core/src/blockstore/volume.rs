//! Volume: a pre-allocated file of fixed-size blocks

use crate::config::BLOCK_SIZE;
use crate::{Result, RidgeError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{error, info};

/// One volume of the block store
pub struct Volume {
    id: u32,
    path: PathBuf,
    file: File,
    capacity: u32,
    cursor: AtomicU32,
    dirty: AtomicBool,
    failed: AtomicBool,
}

impl Volume {
    /// Create a new volume file of `capacity` blocks
    pub fn create(path: &Path, id: u32, capacity: u32, allocate: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let size = capacity as u64 * BLOCK_SIZE as u64;
        if allocate {
            let chunk = vec![0u8; 256 * BLOCK_SIZE];
            let mut written = 0u64;
            while written < size {
                let n = chunk.len().min((size - written) as usize);
                file.write_all(&chunk[..n])?;
                written += n as u64;
            }
        } else {
            file.set_len(size)?;
        }
        file.sync_all()?;

        info!("Created volume {} ({} blocks) at {:?}", id, capacity, path);
        Ok(Self::from_file(path, id, file, capacity, 0))
    }

    /// Open an existing volume with the cursor recorded in the store metadata
    pub fn open(path: &Path, id: u32, capacity: u32, cursor: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < capacity as u64 * BLOCK_SIZE as u64 {
            return Err(RidgeError::InvalidFormat(format!(
                "volume {:?} is {} bytes, expected {} blocks",
                path, len, capacity
            )));
        }
        if cursor > capacity {
            return Err(RidgeError::InvalidFormat(format!(
                "volume {:?} cursor {} beyond capacity {}",
                path, cursor, capacity
            )));
        }
        Ok(Self::from_file(path, id, file, capacity, cursor))
    }

    fn from_file(path: &Path, id: u32, file: File, capacity: u32, cursor: u32) -> Self {
        Self {
            id,
            path: path.to_path_buf(),
            file,
            capacity,
            cursor: AtomicU32::new(cursor),
            dirty: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of allocated blocks
    pub fn cursor(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.cursor() >= self.capacity
    }

    /// A volume that hit an I/O error takes no more writes
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Reserve the next block. Callers serialize allocation.
    pub(crate) fn bump(&self) -> Option<u32> {
        let cursor = self.cursor();
        if cursor >= self.capacity || self.is_failed() {
            return None;
        }
        self.cursor.store(cursor + 1, Ordering::Release);
        Some(cursor)
    }

    /// Read one raw block image
    pub fn read_block(&self, offset: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file
            .read_exact_at(&mut buf, offset as u64 * BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    /// Write one raw block image
    pub fn write_block(&self, offset: u32, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), BLOCK_SIZE);
        if self.is_failed() {
            return Err(RidgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("volume {} is failed", self.id),
            )));
        }
        if let Err(e) = self
            .file
            .write_all_at(image, offset as u64 * BLOCK_SIZE as u64)
        {
            self.mark_failed(&e);
            return Err(e.into());
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Fsync if anything was written since the last flush
    pub fn flush(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.file.sync_data() {
                self.dirty.store(true, Ordering::Release);
                self.mark_failed(&e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn mark_failed(&self, e: &std::io::Error) {
        error!("Volume {} failed: {}", self.id, e);
        self.failed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{decode_block, encode_block, BlockAddr};
    use tempfile::TempDir;

    #[test]
    fn test_volume_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v0.vol");
        let volume = Volume::create(&path, 0, 4, false).unwrap();

        assert_eq!(volume.bump(), Some(0));
        assert_eq!(volume.bump(), Some(1));
        volume.write_block(1, &encode_block(b"second").unwrap()).unwrap();
        volume.flush().unwrap();

        let raw = volume.read_block(1).unwrap();
        assert_eq!(decode_block(BlockAddr::new(0, 1), &raw).unwrap(), b"second");

        assert_eq!(volume.bump(), Some(2));
        assert_eq!(volume.bump(), Some(3));
        assert_eq!(volume.bump(), None);
        assert!(volume.is_full());
    }

    #[test]
    fn test_reopen_keeps_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v0.vol");
        Volume::create(&path, 0, 8, true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * BLOCK_SIZE as u64);

        let volume = Volume::open(&path, 0, 8, 5).unwrap();
        assert_eq!(volume.cursor(), 5);
        assert!(Volume::open(&path, 0, 8, 9).is_err());
        assert!(Volume::open(&path, 0, 16, 0).is_err());
    }
}
