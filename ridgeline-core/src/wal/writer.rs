//! WAL shard writer
//!
//! A shard owns a ring of fixed-size volumes. Appends go to the current
//! volume; a full volume rotates to the next one, which may only be reused
//! once every record in it is checkpointed.

use super::entry::{VolumeHeader, WalRecord, HEADER_SIZE, RECORD_SIZE};
use super::reader::scan_volume;
use super::{SyncPolicy, WalConfig};
use crate::{ParamId, Result, RidgeError, SequenceNumber, Timestamp, Value};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VolumeState {
    pub records: u64,
    pub max_seq: Option<SequenceNumber>,
    pub len: u64,
}

/// One independently rotated log shard
pub struct WalShard {
    id: usize,
    dir: PathBuf,
    header: VolumeHeader,
    volume_size: u64,
    sync_policy: SyncPolicy,
    inner: Mutex<ShardInner>,
}

struct ShardInner {
    file: BufWriter<File>,
    current: usize,
    volumes: Vec<VolumeState>,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalShard {
    /// Create an empty shard in `dir`
    pub(crate) fn create(dir: &Path, id: usize, db_id: Uuid, config: &WalConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let header = VolumeHeader {
            shard: id as u32,
            db_id,
        };
        let file = start_volume(&volume_path(dir, 0), &header)?;
        let mut volumes = vec![VolumeState::default(); config.volumes.max(1)];
        volumes[0].len = HEADER_SIZE as u64;

        Ok(Self::assemble(dir, id, header, config, file, 0, volumes))
    }

    /// Open an existing shard, dropping a torn record at the end of the
    /// current volume
    pub(crate) fn open(dir: &Path, id: usize, db_id: Uuid, config: &WalConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let header = VolumeHeader {
            shard: id as u32,
            db_id,
        };
        let count = config.volumes.max(1).max(existing_volumes(dir)?);

        let mut volumes = Vec::with_capacity(count);
        for index in 0..count {
            let path = volume_path(dir, index);
            if !path.exists() {
                volumes.push(VolumeState::default());
                continue;
            }
            let scanned = scan_volume(&path, Some((header.shard, db_id)))?;
            volumes.push(VolumeState {
                records: scanned.records,
                max_seq: scanned.max_seq,
                len: scanned.valid_len,
            });
        }

        // Resume in the volume holding the newest record
        let current = volumes
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.max_seq.map(|seq| (seq, i)))
            .max()
            .map_or(0, |(_, i)| i);

        let path = volume_path(dir, current);
        let state = volumes[current];
        let file = if state.len < HEADER_SIZE as u64 {
            volumes[current].len = HEADER_SIZE as u64;
            start_volume(&path, &header)?
        } else {
            let file = OpenOptions::new().write(true).open(&path)?;
            let on_disk = file.metadata()?.len();
            if on_disk != state.len {
                warn!(
                    "Truncating WAL volume {:?} from {} to {} bytes",
                    path, on_disk, state.len
                );
                file.set_len(state.len)?;
                file.sync_data()?;
            }
            drop(file);
            OpenOptions::new().append(true).open(&path)?
        };

        Ok(Self::assemble(dir, id, header, config, file, current, volumes))
    }

    fn assemble(
        dir: &Path,
        id: usize,
        header: VolumeHeader,
        config: &WalConfig,
        file: File,
        current: usize,
        volumes: Vec<VolumeState>,
    ) -> Self {
        Self {
            id,
            dir: dir.to_path_buf(),
            header,
            volume_size: config.volume_size.max((HEADER_SIZE + RECORD_SIZE) as u64),
            sync_policy: config.sync_policy,
            inner: Mutex::new(ShardInner {
                file: BufWriter::new(file),
                current,
                volumes,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Append one record. The sequence number is taken from the log-wide
    /// counter while the shard lock is held, so it grows within the shard.
    pub(crate) fn append(
        &self,
        next_seq: &AtomicU64,
        checkpoint: SequenceNumber,
        param_id: ParamId,
        timestamp: Timestamp,
        value: Value,
    ) -> Result<SequenceNumber> {
        let mut inner = self.inner.lock();
        let current = inner.current;
        if inner.volumes[current].len + RECORD_SIZE as u64 > self.volume_size {
            self.rotate(&mut inner, checkpoint)?;
        }

        let seq = next_seq.fetch_add(1, Ordering::SeqCst);
        let record = WalRecord {
            seq,
            param_id,
            timestamp,
            value,
        };
        inner.file.write_all(&record.encode())?;

        let current = inner.current;
        let state = &mut inner.volumes[current];
        state.records += 1;
        state.max_seq = Some(seq);
        state.len += RECORD_SIZE as u64;
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            sync(&mut inner)?;
        }
        Ok(seq)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        sync(&mut self.inner.lock())
    }

    /// Newest sequence number in the shard
    pub fn max_seq(&self) -> Option<SequenceNumber> {
        self.inner.lock().volumes.iter().filter_map(|v| v.max_seq).max()
    }

    /// Volumes with records, for replay
    pub(crate) fn replay_sources(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        Ok(inner
            .volumes
            .iter()
            .enumerate()
            .filter(|(_, v)| v.records > 0)
            .map(|(i, v)| (volume_path(&self.dir, i), v.records))
            .collect())
    }

    pub fn stats(&self) -> ShardStats {
        let inner = self.inner.lock();
        ShardStats {
            id: self.id,
            current_volume: inner.current,
            volumes: inner
                .volumes
                .iter()
                .enumerate()
                .map(|(index, v)| WalVolumeStats {
                    index,
                    path: volume_path(&self.dir, index).display().to_string(),
                    records: v.records,
                    max_seq: v.max_seq,
                    bytes: v.len,
                })
                .collect(),
        }
    }

    fn should_sync(&self, inner: &ShardInner) -> bool {
        match self.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn rotate(&self, inner: &mut ShardInner, checkpoint: SequenceNumber) -> Result<()> {
        let next = (inner.current + 1) % inner.volumes.len();
        if let Some(max_seq) = inner.volumes[next].max_seq {
            if max_seq > checkpoint {
                warn!(
                    shard = self.id,
                    volume = next,
                    max_seq,
                    checkpoint,
                    "WAL shard saturated"
                );
                return Err(RidgeError::WalSaturated { shard: self.id });
            }
        }

        sync(inner)?;
        inner.file = BufWriter::new(start_volume(&volume_path(&self.dir, next), &self.header)?);
        inner.volumes[next] = VolumeState {
            records: 0,
            max_seq: None,
            len: HEADER_SIZE as u64,
        };
        inner.current = next;
        info!(shard = self.id, volume = next, "WAL rotated");
        Ok(())
    }
}

fn sync(inner: &mut ShardInner) -> Result<()> {
    inner.file.flush()?;
    inner.file.get_ref().sync_data()?;
    inner.writes_since_sync = 0;
    inner.last_sync = Instant::now();
    Ok(())
}

/// Truncate a volume and stamp a fresh header
fn start_volume(path: &Path, header: &VolumeHeader) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&header.encode())?;
    file.sync_data()?;
    Ok(file)
}

pub(crate) fn volume_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("wal_{:04}.log", index))
}

/// Number of volume slots present in a shard directory
pub(crate) fn existing_volumes(dir: &Path) -> Result<usize> {
    let mut count = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(index) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|s| s.strip_prefix("wal_"))
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.parse::<usize>().ok())
        {
            count = count.max(index + 1);
        }
    }
    Ok(count)
}

/// Shard statistics
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub id: usize,
    pub current_volume: usize,
    pub volumes: Vec<WalVolumeStats>,
}

/// Log volume statistics
#[derive(Debug, Clone, Serialize)]
pub struct WalVolumeStats {
    pub index: usize,
    pub path: String,
    pub records: u64,
    pub max_seq: Option<SequenceNumber>,
    pub bytes: u64,
}
