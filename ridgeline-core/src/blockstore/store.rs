//! Block store: allocation and checksummed I/O over a set of volumes

use super::block::{decode_block, encode_block};
use super::{BlockAddr, BlockStoreConfig, StoreMode, Volume};
use crate::fsutil::{read_framed, write_framed};
use crate::{Result, RidgeError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const META_FILE: &str = "blockstore.meta";
const META_MAGIC: &[u8; 4] = b"RBSM";
const META_VERSION: u32 = 1;

/// Persisted allocation state
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockStoreMeta {
    db_id: Uuid,
    mode: StoreMode,
    capacity: u32,
    cursors: Vec<u32>,
    active: u32,
}

/// Allocates and stores blocks across rotating volumes
pub struct BlockStore {
    dir: PathBuf,
    db_id: Uuid,
    mode: StoreMode,
    capacity: u32,
    volumes: RwLock<Vec<Arc<Volume>>>,
    active: Mutex<usize>,
}

impl BlockStore {
    /// Create a new block store, allocating all configured volumes
    pub fn create(dir: &Path, config: &BlockStoreConfig, db_id: Uuid) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        if dir.join(META_FILE).exists() {
            return Err(RidgeError::Config(format!("block store already exists in {:?}", dir)));
        }

        let capacity = config.capacity_blocks();
        if capacity == 0 || config.volumes == 0 {
            return Err(RidgeError::Config(
                "block store needs at least one volume of one block".into(),
            ));
        }

        let mut volumes = Vec::with_capacity(config.volumes);
        for id in 0..config.volumes as u32 {
            let volume = Volume::create(&volume_path(dir, id), id, capacity, config.allocate)?;
            volumes.push(Arc::new(volume));
        }

        let store = Self {
            dir: dir.to_path_buf(),
            db_id,
            mode: config.mode,
            capacity,
            volumes: RwLock::new(volumes),
            active: Mutex::new(0),
        };
        store.write_meta()?;
        info!(
            "Created block store with {} volumes of {} blocks ({:?} mode)",
            config.volumes, capacity, config.mode
        );
        Ok(store)
    }

    /// Open an existing block store
    pub fn open(dir: &Path) -> Result<Self> {
        let payload = read_framed(&dir.join(META_FILE), META_MAGIC, META_VERSION)?;
        let meta: BlockStoreMeta = bincode::deserialize(&payload)?;

        let mut volumes = Vec::with_capacity(meta.cursors.len());
        for (id, cursor) in meta.cursors.iter().enumerate() {
            let id = id as u32;
            let volume = Volume::open(&volume_path(dir, id), id, meta.capacity, *cursor)?;
            volumes.push(Arc::new(volume));
        }
        if volumes.is_empty() || meta.active as usize >= volumes.len() {
            return Err(RidgeError::InvalidFormat(format!(
                "block store metadata in {:?} is inconsistent",
                dir
            )));
        }

        info!(
            "Opened block store with {} volumes, active volume {}",
            volumes.len(),
            meta.active
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            db_id: meta.db_id,
            mode: meta.mode,
            capacity: meta.capacity,
            volumes: RwLock::new(volumes),
            active: Mutex::new(meta.active as usize),
        })
    }

    /// Check whether a block store exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        dir.join(META_FILE).exists()
    }

    /// Database instance this store belongs to
    pub fn db_id(&self) -> Uuid {
        self.db_id
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Reserve the next free block, rotating to the next volume when the
    /// active one is full
    pub fn allocate(&self) -> Result<BlockAddr> {
        let mut active = self.active.lock();
        loop {
            let volume = self.volumes.read()[*active].clone();
            if let Some(offset) = volume.bump() {
                return Ok(BlockAddr::new(volume.id(), offset));
            }

            // The volume is sealed, make its blocks durable before moving on
            if let Err(e) = volume.flush() {
                warn!("Failed to sync sealed volume {}: {}", volume.id(), e);
            }

            let count = self.volumes.read().len();
            if *active + 1 < count {
                *active += 1;
                info!("Block store rotated to volume {}", *active);
                continue;
            }

            match self.mode {
                StoreMode::Fixed => return Err(RidgeError::OutOfSpace { volumes: count }),
                StoreMode::Expandable => {
                    let id = count as u32;
                    let path = volume_path(&self.dir, id);
                    if path.exists() {
                        // Left over from a crash before the metadata listed it
                        std::fs::remove_file(&path)?;
                    }
                    let volume = Volume::create(&path, id, self.capacity, false)?;
                    self.volumes.write().push(Arc::new(volume));
                    *active += 1;
                    info!("Block store expanded to {} volumes", count + 1);
                }
            }
        }
    }

    /// Write a payload to an allocated block. Rewriting the same block with
    /// the same payload is harmless.
    pub fn write(&self, addr: BlockAddr, payload: &[u8]) -> Result<()> {
        let image = encode_block(payload)?;
        let volume = self.volume(addr).ok_or_else(|| {
            RidgeError::InvalidFormat(format!("write to unknown volume at {}", addr))
        })?;
        if addr.offset >= volume.cursor() {
            return Err(RidgeError::InvalidFormat(format!(
                "write to unallocated block {}",
                addr
            )));
        }
        volume.write_block(addr.offset, &image)
    }

    /// Allocate a block and write a payload to it
    pub fn append(&self, payload: &[u8]) -> Result<BlockAddr> {
        // Frame first so an oversized payload doesn't burn a block
        let image = encode_block(payload)?;
        let addr = self.allocate()?;
        let volume = self
            .volume(addr)
            .ok_or_else(|| RidgeError::Internal(format!("allocated block {} has no volume", addr)))?;
        volume.write_block(addr.offset, &image)?;
        Ok(addr)
    }

    /// Read a block payload
    pub fn read(&self, addr: BlockAddr) -> Result<Vec<u8>> {
        let volume = self
            .volume(addr)
            .ok_or_else(|| RidgeError::corruption(addr, "no such volume"))?;
        if addr.offset >= volume.cursor() {
            return Err(RidgeError::corruption(addr, "block is not allocated"));
        }
        let raw = volume.read_block(addr.offset)?;
        decode_block(addr, &raw)
    }

    /// Sync all volumes and persist the allocation cursors
    pub fn flush(&self) -> Result<()> {
        let volumes: Vec<Arc<Volume>> = self.volumes.read().clone();
        for volume in &volumes {
            volume.flush()?;
        }
        self.write_meta()
    }

    /// Allocation statistics
    pub fn stats(&self) -> BlockStoreStats {
        let active = *self.active.lock();
        let volumes = self.volumes.read();
        BlockStoreStats {
            db_id: self.db_id.to_string(),
            mode: self.mode,
            block_size: crate::config::BLOCK_SIZE,
            volume_capacity: self.capacity,
            active_volume: active as u32,
            volumes: volumes
                .iter()
                .map(|v| VolumeStats {
                    id: v.id(),
                    path: v.path().display().to_string(),
                    used_blocks: v.cursor(),
                    failed: v.is_failed(),
                })
                .collect(),
        }
    }

    fn volume(&self, addr: BlockAddr) -> Option<Arc<Volume>> {
        self.volumes.read().get(addr.volume as usize).cloned()
    }

    fn write_meta(&self) -> Result<()> {
        let active = *self.active.lock() as u32;
        let meta = BlockStoreMeta {
            db_id: self.db_id,
            mode: self.mode,
            capacity: self.capacity,
            cursors: self.volumes.read().iter().map(|v| v.cursor()).collect(),
            active,
        };
        let payload = bincode::serialize(&meta)?;
        write_framed(&self.dir.join(META_FILE), META_MAGIC, META_VERSION, &payload)
    }
}

fn volume_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("volume_{:06}.vol", id))
}

/// Block store statistics
#[derive(Debug, Clone, Serialize)]
pub struct BlockStoreStats {
    pub db_id: String,
    pub mode: StoreMode,
    pub block_size: usize,
    pub volume_capacity: u32,
    pub active_volume: u32,
    pub volumes: Vec<VolumeStats>,
}

/// Per-volume statistics
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStats {
    pub id: u32,
    pub path: String,
    pub used_blocks: u32,
    pub failed: bool,
}

impl BlockStoreStats {
    /// Blocks handed out across all volumes
    pub fn used_blocks(&self) -> u64 {
        self.volumes.iter().map(|v| v.used_blocks as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BLOCK_SIZE;
    use tempfile::TempDir;

    fn config(volumes: usize, blocks: u64, mode: StoreMode) -> BlockStoreConfig {
        BlockStoreConfig {
            volumes,
            volume_size: blocks * BLOCK_SIZE as u64,
            mode,
            allocate: false,
        }
    }

    #[test]
    fn test_append_read_reopen() {
        let dir = TempDir::new().unwrap();
        let db_id = Uuid::new_v4();
        let addrs: Vec<BlockAddr> = {
            let store = BlockStore::create(dir.path(), &config(2, 4, StoreMode::Fixed), db_id).unwrap();
            let addrs = (0..6u8)
                .map(|i| store.append(&[i; 32]).unwrap())
                .collect::<Vec<_>>();
            store.flush().unwrap();
            addrs
        };

        assert_eq!(addrs[3], BlockAddr::new(0, 3));
        assert_eq!(addrs[4], BlockAddr::new(1, 0));

        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.db_id(), db_id);
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(store.read(*addr).unwrap(), vec![i as u8; 32]);
        }
        assert_eq!(store.allocate().unwrap(), BlockAddr::new(1, 2));
    }

    #[test]
    fn test_fixed_mode_out_of_space() {
        let dir = TempDir::new().unwrap();
        let store =
            BlockStore::create(dir.path(), &config(2, 2, StoreMode::Fixed), Uuid::new_v4()).unwrap();
        let live: Vec<BlockAddr> = (0..4u8).map(|i| store.append(&[i]).unwrap()).collect();

        let err = store.append(b"overflow").unwrap_err();
        assert!(matches!(err, RidgeError::OutOfSpace { volumes: 2 }));
        assert!(err.is_backpressure());

        // Nothing live got overwritten
        for (i, addr) in live.iter().enumerate() {
            assert_eq!(store.read(*addr).unwrap(), vec![i as u8]);
        }
    }

    #[test]
    fn test_expandable_mode_grows() {
        let dir = TempDir::new().unwrap();
        let store =
            BlockStore::create(dir.path(), &config(1, 2, StoreMode::Expandable), Uuid::new_v4())
                .unwrap();
        for i in 0..7u8 {
            store.append(&[i]).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.volumes.len(), 4);
        assert_eq!(stats.used_blocks(), 7);
        store.flush().unwrap();

        let reopened = BlockStore::open(dir.path()).unwrap();
        assert_eq!(reopened.read(BlockAddr::new(3, 0)).unwrap(), vec![6u8]);
    }

    #[test]
    fn test_read_errors_are_corruption() {
        let dir = TempDir::new().unwrap();
        let store =
            BlockStore::create(dir.path(), &config(1, 4, StoreMode::Fixed), Uuid::new_v4()).unwrap();
        let allocated = store.allocate().unwrap();

        // allocated but never written: zeroes fail the checksum
        assert!(store.read(allocated).unwrap_err().is_corruption());
        assert!(store.read(BlockAddr::new(0, 3)).unwrap_err().is_corruption());
        assert!(store.read(BlockAddr::new(9, 0)).unwrap_err().is_corruption());
        assert!(store.write(BlockAddr::new(0, 2), b"x").is_err());

        // idempotent rewrite of the same address
        store.write(allocated, b"payload").unwrap();
        store.write(allocated, b"payload").unwrap();
        assert_eq!(store.read(allocated).unwrap(), b"payload");
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let cfg = config(1, 4, StoreMode::Fixed);
        BlockStore::create(dir.path(), &cfg, Uuid::new_v4()).unwrap();
        assert!(matches!(
            BlockStore::create(dir.path(), &cfg, Uuid::new_v4()),
            Err(RidgeError::Config(_))
        ));
    }
}
