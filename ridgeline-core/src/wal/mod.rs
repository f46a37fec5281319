//! Write-Ahead Log (WAL) implementation
//!
//! Every accepted sample is appended here before it reaches its tree. The
//! log is split into shards so that concurrent writers don't contend on one
//! file; each shard rotates through a fixed ring of volumes.
//!
//! Sequence numbers come from one log-wide counter, so replay can merge all
//! shards into a single ordered stream of the records newer than the last
//! checkpoint.

mod entry;
mod reader;
mod writer;

pub use entry::{VolumeHeader, WalRecord, HEADER_SIZE, RECORD_SIZE};
pub use reader::{ScannedVolume, WalReplay};
pub use writer::{ShardStats, WalShard, WalVolumeStats};

use crate::fsutil::{read_framed, write_framed};
use crate::{ParamId, Result, RidgeError, SequenceNumber, Timestamp, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

const CHECKPOINT_FILE: &str = "checkpoint";
const CHECKPOINT_MAGIC: &[u8; 4] = b"RWCP";
const CHECKPOINT_VERSION: u32 = 1;

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// WAL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Number of independent shards
    pub shards: usize,
    /// Volumes per shard
    pub volumes: usize,
    /// Volume size in bytes
    #[serde(deserialize_with = "crate::memsize::deserialize")]
    pub volume_size: u64,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            shards: std::thread::available_parallelism().map_or(1, |n| n.get()),
            volumes: crate::config::WAL_VOLUMES,
            volume_size: crate::config::WAL_VOLUME_SIZE,
            sync_policy: SyncPolicy::default(),
        }
    }
}

/// The sharded input log
pub struct InputLog {
    dir: PathBuf,
    db_id: Uuid,
    shards: Vec<WalShard>,
    next_seq: AtomicU64,
    checkpoint: AtomicU64,
    checkpoint_lock: Mutex<()>,
}

impl InputLog {
    /// Create an empty log
    pub fn create(config: &WalConfig, db_id: Uuid) -> Result<Self> {
        Self::create_after(config, db_id, 0)
    }

    /// Create an empty log whose first record gets sequence `start + 1`.
    ///
    /// A log recreated for an existing database must start above every
    /// checkpoint its catalog recorded, or replay would skip the new records.
    pub fn create_after(config: &WalConfig, db_id: Uuid, start: SequenceNumber) -> Result<Self> {
        if Self::exists(&config.dir) {
            return Err(RidgeError::Config(format!(
                "WAL already exists in {:?}",
                config.dir
            )));
        }
        fs::create_dir_all(&config.dir)?;
        write_checkpoint(&config.dir, start)?;

        let shards = (0..config.shards.max(1))
            .map(|id| WalShard::create(&shard_dir(&config.dir, id), id, db_id, config))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Created WAL with {} shards of {} volumes in {:?}, starting after sequence {}",
            shards.len(),
            config.volumes,
            config.dir,
            start
        );
        Ok(Self {
            dir: config.dir.clone(),
            db_id,
            shards,
            next_seq: AtomicU64::new(start + 1),
            checkpoint: AtomicU64::new(start),
            checkpoint_lock: Mutex::new(()),
        })
    }

    /// Open an existing log. Shards left over from a run configured with
    /// more shards are kept so that their records are replayed.
    pub fn open(config: &WalConfig, db_id: Uuid) -> Result<Self> {
        let checkpoint = read_checkpoint(&config.dir)?;
        let count = config.shards.max(1).max(existing_shards(&config.dir)?);

        let shards = (0..count)
            .map(|id| WalShard::open(&shard_dir(&config.dir, id), id, db_id, config))
            .collect::<Result<Vec<_>>>()?;

        let newest = shards
            .iter()
            .filter_map(WalShard::max_seq)
            .max()
            .unwrap_or(0)
            .max(checkpoint);

        info!(
            "Opened WAL in {:?}: {} shards, checkpoint {}, last sequence {}",
            config.dir,
            shards.len(),
            checkpoint,
            newest
        );
        Ok(Self {
            dir: config.dir.clone(),
            db_id,
            shards,
            next_seq: AtomicU64::new(newest + 1),
            checkpoint: AtomicU64::new(checkpoint),
            checkpoint_lock: Mutex::new(()),
        })
    }

    /// Check whether a log exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        dir.join(CHECKPOINT_FILE).exists()
    }

    /// Delete a log directory
    pub fn remove(dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
            info!("Removed WAL in {:?}", dir);
        }
        Ok(())
    }

    pub fn db_id(&self) -> Uuid {
        self.db_id
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Durably log a sample on `shard` (taken modulo the shard count)
    pub fn append(
        &self,
        shard: usize,
        param_id: ParamId,
        timestamp: Timestamp,
        value: Value,
    ) -> Result<SequenceNumber> {
        let shard = &self.shards[shard % self.shards.len()];
        shard.append(
            &self.next_seq,
            self.checkpoint.load(Ordering::Acquire),
            param_id,
            timestamp,
            value,
        )
    }

    /// Highest sequence number handed out so far
    pub fn last_sequence(&self) -> SequenceNumber {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Current checkpoint
    pub fn checkpointed(&self) -> SequenceNumber {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Record that everything up to `upto` is reflected in committed trees.
    /// Volumes whose records are all at or below it become reusable.
    pub fn checkpoint(&self, upto: SequenceNumber) -> Result<()> {
        let _guard = self.checkpoint_lock.lock();
        if upto <= self.checkpointed() {
            return Ok(());
        }
        write_checkpoint(&self.dir, upto)?;
        self.checkpoint.store(upto, Ordering::Release);
        debug!(upto, "WAL checkpoint");
        Ok(())
    }

    /// Records newer than the checkpoint, merged across shards
    pub fn replay(&self) -> Result<WalReplay> {
        let mut sources = Vec::new();
        for shard in &self.shards {
            sources.extend(shard.replay_sources()?);
        }
        WalReplay::new(sources, self.checkpointed())
    }

    /// Flush and sync every shard
    pub fn sync(&self) -> Result<()> {
        for shard in &self.shards {
            shard.sync()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            dir: self.dir.display().to_string(),
            checkpoint: self.checkpointed(),
            last_sequence: self.last_sequence(),
            shards: self.shards.iter().map(WalShard::stats).collect(),
        }
    }

    /// Examine a log on disk without modifying it. Returns its statistics and
    /// the records a restart would replay.
    pub fn inspect(dir: &Path) -> Result<(WalStats, WalReplay)> {
        let checkpoint = read_checkpoint(dir)?;
        let mut shards = Vec::new();
        let mut sources = Vec::new();
        let mut last_sequence = checkpoint;

        for id in 0..existing_shards(dir)? {
            let sdir = shard_dir(dir, id);
            let mut volumes = Vec::new();
            for index in 0..writer::existing_volumes(&sdir)? {
                let path = writer::volume_path(&sdir, index);
                if !path.exists() {
                    continue;
                }
                let scanned = reader::scan_volume(&path, None)?;
                last_sequence = last_sequence.max(scanned.max_seq.unwrap_or(0));
                sources.push((path.clone(), scanned.records));
                volumes.push(WalVolumeStats {
                    index,
                    path: path.display().to_string(),
                    records: scanned.records,
                    max_seq: scanned.max_seq,
                    bytes: scanned.valid_len,
                });
            }
            let current_volume = volumes
                .iter()
                .filter_map(|v| v.max_seq.map(|seq| (seq, v.index)))
                .max()
                .map_or(0, |(_, i)| i);
            shards.push(ShardStats {
                id,
                current_volume,
                volumes,
            });
        }

        let stats = WalStats {
            dir: dir.display().to_string(),
            checkpoint,
            last_sequence,
            shards,
        };
        Ok((stats, WalReplay::new(sources, checkpoint)?))
    }
}

/// WAL statistics
#[derive(Debug, Clone, Serialize)]
pub struct WalStats {
    pub dir: String,
    pub checkpoint: SequenceNumber,
    pub last_sequence: SequenceNumber,
    pub shards: Vec<ShardStats>,
}

fn shard_dir(dir: &Path, id: usize) -> PathBuf {
    dir.join(format!("shard_{}", id))
}

fn existing_shards(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.strip_prefix("shard_"))
            .and_then(|s| s.parse::<usize>().ok())
        {
            count = count.max(id + 1);
        }
    }
    Ok(count)
}

fn write_checkpoint(dir: &Path, seq: SequenceNumber) -> Result<()> {
    write_framed(
        &dir.join(CHECKPOINT_FILE),
        CHECKPOINT_MAGIC,
        CHECKPOINT_VERSION,
        &seq.to_le_bytes(),
    )
}

fn read_checkpoint(dir: &Path) -> Result<SequenceNumber> {
    let payload = read_framed(&dir.join(CHECKPOINT_FILE), CHECKPOINT_MAGIC, CHECKPOINT_VERSION)?;
    let raw: [u8; 8] = payload
        .as_slice()
        .try_into()
        .map_err(|_| RidgeError::InvalidFormat("bad WAL checkpoint".into()))?;
    Ok(u64::from_le_bytes(raw))
}
