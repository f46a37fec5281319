//! Volume scanning and replay

use super::entry::{VolumeHeader, WalRecord, HEADER_SIZE, RECORD_SIZE};
use crate::{Result, RidgeError, SequenceNumber};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// What a scan found in one log volume
#[derive(Debug, Clone)]
pub struct ScannedVolume {
    pub path: PathBuf,
    pub header: Option<VolumeHeader>,
    /// Bytes up to the end of the last intact record
    pub valid_len: u64,
    pub file_len: u64,
    pub records: u64,
    pub min_seq: Option<SequenceNumber>,
    pub max_seq: Option<SequenceNumber>,
}

/// Scan a volume up to the first torn or corrupted record.
///
/// A file too short to hold a header counts as empty. A header naming
/// another shard or database is an error.
pub(crate) fn scan_volume(path: &Path, expect: Option<(u32, Uuid)>) -> Result<ScannedVolume> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut scanned = ScannedVolume {
        path: path.to_path_buf(),
        header: None,
        valid_len: 0,
        file_len,
        records: 0,
        min_seq: None,
        max_seq: None,
    };
    if file_len < HEADER_SIZE as u64 {
        return Ok(scanned);
    }

    let mut reader = BufReader::new(file);
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    let header = VolumeHeader::decode(&buf)?;
    if let Some((shard, db_id)) = expect {
        if header.shard != shard || header.db_id != db_id {
            return Err(RidgeError::InvalidFormat(format!(
                "{:?} belongs to shard {} of database {}",
                path, header.shard, header.db_id
            )));
        }
    }
    scanned.header = Some(header);
    scanned.valid_len = HEADER_SIZE as u64;

    let mut record = [0u8; RECORD_SIZE];
    loop {
        match read_record(&mut reader, &mut record) {
            Ok(Some(r)) => {
                scanned.records += 1;
                scanned.valid_len += RECORD_SIZE as u64;
                scanned.min_seq = Some(scanned.min_seq.map_or(r.seq, |s| s.min(r.seq)));
                scanned.max_seq = Some(scanned.max_seq.map_or(r.seq, |s| s.max(r.seq)));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    "Stopping scan of {:?} at offset {}: {}",
                    path, scanned.valid_len, e
                );
                break;
            }
        }
    }
    Ok(scanned)
}

/// `Ok(None)` at a clean or torn end of file
fn read_record<R: Read>(reader: &mut R, buf: &mut [u8; RECORD_SIZE]) -> Result<Option<WalRecord>> {
    match reader.read_exact(buf) {
        Ok(()) => WalRecord::decode(buf).map(Some),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Records of one volume, in the order they were written
struct VolumeReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl VolumeReader {
    fn open(path: &Path, records: u64) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        Ok(Self {
            reader,
            remaining: records,
        })
    }

    fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut buf = [0u8; RECORD_SIZE];
        read_record(&mut self.reader, &mut buf)
    }
}

/// Lazy merge of every volume of every shard in sequence order, skipping
/// records at or below the checkpoint
pub struct WalReplay {
    readers: Vec<VolumeReader>,
    heads: Vec<Option<WalRecord>>,
    heap: BinaryHeap<Reverse<(SequenceNumber, usize)>>,
    after: SequenceNumber,
    error: Option<RidgeError>,
    failed: bool,
}

impl WalReplay {
    /// `volumes` lists each volume with the number of intact records it holds
    pub(crate) fn new(volumes: Vec<(PathBuf, u64)>, after: SequenceNumber) -> Result<Self> {
        let mut replay = Self {
            readers: Vec::with_capacity(volumes.len()),
            heads: Vec::with_capacity(volumes.len()),
            heap: BinaryHeap::new(),
            after,
            error: None,
            failed: false,
        };
        for (path, records) in volumes {
            if records == 0 {
                continue;
            }
            replay.readers.push(VolumeReader::open(&path, records)?);
            replay.heads.push(None);
            replay.advance(replay.readers.len() - 1)?;
        }
        Ok(replay)
    }

    /// Checkpoint the replay starts after
    pub fn after(&self) -> SequenceNumber {
        self.after
    }

    fn advance(&mut self, idx: usize) -> Result<()> {
        while let Some(record) = self.readers[idx].next_record()? {
            if record.seq > self.after {
                self.heap.push(Reverse((record.seq, idx)));
                self.heads[idx] = Some(record);
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        let Reverse((_, idx)) = self.heap.pop()?;
        let record = self.heads[idx].take()?;
        if let Err(e) = self.advance(idx) {
            self.error = Some(e);
        }
        Some(Ok(record))
    }
}
