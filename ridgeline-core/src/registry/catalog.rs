//! Persistent series catalog
//!
//! Two files:
//! - `catalog.json`: snapshot of every entry, rewritten atomically on checkpoint
//! - `catalog.journal`: series created or deleted since the snapshot, each
//!   record synced before the operation returns
//!
//! Journal record format: u32 length, u32 crc32, bincode body.

use crate::blockstore::BlockAddr;
use crate::fsutil::{read_framed, sync_parent_dir, write_framed};
use crate::{ParamId, Result, RidgeError, SequenceNumber};
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SNAPSHOT_FILE: &str = "catalog.json";
const JOURNAL_FILE: &str = "catalog.journal";
const SNAPSHOT_MAGIC: &[u8; 4] = b"RCAT";
const SNAPSHOT_VERSION: u32 = 1;

/// Durable state of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Canonical series name
    pub name: String,
    pub param_id: ParamId,
    /// Last committed tree root
    pub root: Option<BlockAddr>,
    /// WAL records up to here are contained in `root`
    pub checkpoint: SequenceNumber,
    pub deleted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_param_id: ParamId,
    entries: Vec<CatalogEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    Created { name: String, param_id: ParamId },
    Deleted { param_id: ParamId },
}

/// Contents of a loaded catalog
#[derive(Debug, Default)]
pub struct CatalogState {
    pub entries: Vec<CatalogEntry>,
    pub next_param_id: ParamId,
}

/// Append handle on the journal. Holding it serializes catalog mutations.
pub struct Journal {
    file: File,
    records: usize,
}

impl Journal {
    /// Log a newly created series
    pub fn created(&mut self, name: &str, param_id: ParamId) -> Result<()> {
        self.append(&JournalRecord::Created {
            name: name.to_string(),
            param_id,
        })
    }

    /// Log a deleted series
    pub fn deleted(&mut self, param_id: ParamId) -> Result<()> {
        self.append(&JournalRecord::Deleted { param_id })
    }

    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let body = bincode::serialize(record)?;
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.records += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.records = 0;
        Ok(())
    }
}

/// Snapshot plus journal
pub struct Catalog {
    dir: PathBuf,
    journal: Mutex<Journal>,
}

impl Catalog {
    /// Create an empty catalog in `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        if Self::exists(dir) {
            return Err(RidgeError::Catalog(format!("catalog already exists in {:?}", dir)));
        }
        write_snapshot(dir, &Snapshot {
            next_param_id: 1,
            entries: Vec::new(),
        })?;
        let file = open_journal(dir)?;
        file.set_len(0)?;
        sync_parent_dir(&dir.join(JOURNAL_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            journal: Mutex::new(Journal { file, records: 0 }),
        })
    }

    /// Load the snapshot and apply the journal on top of it
    pub fn open(dir: &Path) -> Result<(Self, CatalogState)> {
        let (state, records, valid_len) = Self::load(dir)?;
        let file = open_journal(dir)?;
        if file.metadata()?.len() != valid_len {
            // Appends must not land behind a torn record
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        info!(
            "Loaded catalog with {} entries ({} journal records)",
            state.entries.len(),
            records
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                journal: Mutex::new(Journal { file, records }),
            },
            state,
        ))
    }

    /// Read the catalog without opening it for writing
    pub fn read(dir: &Path) -> Result<CatalogState> {
        Ok(Self::load(dir)?.0)
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(SNAPSHOT_FILE).exists()
    }

    /// Lock the journal for a mutation
    pub fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock()
    }

    /// Write a new snapshot and empty the journal. The caller holds the
    /// journal so that no creation slips between the two steps.
    pub fn save(
        &self,
        journal: &mut Journal,
        entries: Vec<CatalogEntry>,
        next_param_id: ParamId,
    ) -> Result<()> {
        write_snapshot(&self.dir, &Snapshot {
            next_param_id,
            entries,
        })?;
        journal.reset()
    }

    fn load(dir: &Path) -> Result<(CatalogState, usize, u64)> {
        let payload = read_framed(&dir.join(SNAPSHOT_FILE), SNAPSHOT_MAGIC, SNAPSHOT_VERSION)
            .map_err(|e| RidgeError::Catalog(format!("snapshot unreadable: {}", e)))?;
        let snapshot: Snapshot = serde_json::from_slice(&payload)?;

        let mut entries: BTreeMap<ParamId, CatalogEntry> = snapshot
            .entries
            .into_iter()
            .map(|e| (e.param_id, e))
            .collect();
        let mut next_param_id = snapshot.next_param_id;

        let (records, valid_len) = read_journal(&dir.join(JOURNAL_FILE))?;
        let applied = records.len();
        for record in records {
            match record {
                JournalRecord::Created { name, param_id } => {
                    next_param_id = next_param_id.max(param_id + 1);
                    entries.entry(param_id).or_insert(CatalogEntry {
                        name,
                        param_id,
                        root: None,
                        checkpoint: 0,
                        deleted: false,
                    });
                }
                JournalRecord::Deleted { param_id } => {
                    if let Some(entry) = entries.get_mut(&param_id) {
                        entry.deleted = true;
                    }
                }
            }
        }

        Ok((
            CatalogState {
                entries: entries.into_values().collect(),
                next_param_id,
            },
            applied,
            valid_len,
        ))
    }
}

fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let payload = serde_json::to_vec_pretty(snapshot)?;
    write_framed(&dir.join(SNAPSHOT_FILE), SNAPSHOT_MAGIC, SNAPSHOT_VERSION, &payload)
}

fn open_journal(dir: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(JOURNAL_FILE))?)
}

/// Records up to the first torn or corrupted one, and the length they span
fn read_journal(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut cursor = data.as_slice();

    while cursor.len() >= 8 {
        let mut header = &cursor[..8];
        let len = header.get_u32_le() as usize;
        let expected = header.get_u32_le();
        let Some(body) = cursor.get(8..8 + len) else {
            warn!("Catalog journal ends with a torn record");
            break;
        };
        if crc32fast::hash(body) != expected {
            warn!("Catalog journal record failed its checksum, ignoring the rest");
            break;
        }
        records.push(bincode::deserialize(body)?);
        cursor = &cursor[8 + len..];
    }
    Ok((records, (data.len() - cursor.len()) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_journal_then_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = Catalog::create(dir.path()).unwrap();
            let mut journal = catalog.journal();
            journal.created("cpu host=a", 1).unwrap();
            journal.created("cpu host=b", 2).unwrap();
            journal.deleted(1).unwrap();
        }

        let (catalog, state) = Catalog::open(dir.path()).unwrap();
        assert_eq!(state.next_param_id, 3);
        assert_eq!(state.entries.len(), 2);
        assert!(state.entries[0].deleted);
        assert_eq!(state.entries[1].name, "cpu host=b");

        let mut entries = state.entries;
        entries[1].root = Some(BlockAddr::new(0, 9));
        entries[1].checkpoint = 40;
        {
            let mut journal = catalog.journal();
            assert_eq!(journal.len(), 3);
            catalog.save(&mut journal, entries.clone(), 3).unwrap();
            assert!(journal.is_empty());
            journal.created("mem host=a", 3).unwrap();
        }
        drop(catalog);

        let state = Catalog::read(dir.path()).unwrap();
        assert_eq!(state.next_param_id, 4);
        assert_eq!(&state.entries[..2], &entries[..]);
        assert_eq!(state.entries[2].name, "mem host=a");
    }

    #[test]
    fn test_torn_journal_record_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = Catalog::create(dir.path()).unwrap();
            catalog.journal().created("a", 1).unwrap();
        }
        let path = dir.path().join(JOURNAL_FILE);
        let mut raw = fs::read(&path).unwrap();
        raw.extend_from_slice(&[40, 0, 0, 0, 1, 2]);
        fs::write(&path, raw).unwrap();

        let (catalog, state) = Catalog::open(dir.path()).unwrap();
        assert_eq!(state.entries.len(), 1);
        catalog.journal().created("b", 2).unwrap();
        drop(catalog);

        let state = Catalog::read(dir.path()).unwrap();
        assert_eq!(state.entries.len(), 2);
        assert!(Catalog::create(dir.path()).is_err());
    }
}
