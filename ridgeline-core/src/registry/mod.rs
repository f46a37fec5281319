//! Tree registry
//!
//! Owns every series tree and the catalog that makes the name to ParamId
//! mapping durable. Lookups of known names go through a lock-free skip map.
//! Creating a series takes the catalog journal lock, which serializes
//! first-sight resolution so that exactly one ParamId is ever created per
//! name.
//!
//! A write logs its record while holding the tree's writer lock, so each
//! tree applies its records in sequence order and knows the newest one it
//! holds. A checkpoint commits tree by tree; ingestion into other series
//! goes on meanwhile. Writes hold the write gate shared only to keep a
//! series deletion from slipping between lookup and append.

mod catalog;
mod dispatcher;

pub use catalog::{Catalog, CatalogEntry, CatalogState, Journal};
pub use dispatcher::Dispatcher;

use crate::blockstore::{BlockAddr, BlockStore};
use crate::nbtree::{NBTree, TreeConfig, TreeStats};
use crate::wal::{InputLog, WalReplay};
use crate::{ParamId, Result, RidgeError, SequenceNumber, SeriesName, Timestamp, Value, WriteStatus};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

enum SeriesState {
    Live(Arc<NBTree>),
    /// The committed tree could not be opened
    Broken {
        root: Option<BlockAddr>,
        reason: String,
    },
    Deleted {
        root: Option<BlockAddr>,
    },
}

struct SeriesEntry {
    name: String,
    param_id: ParamId,
    state: SeriesState,
    checkpoint: AtomicU64,
}

impl SeriesEntry {
    fn to_catalog(&self) -> CatalogEntry {
        let (root, deleted) = match &self.state {
            SeriesState::Live(tree) => (tree.root(), false),
            SeriesState::Broken { root, .. } => (*root, false),
            SeriesState::Deleted { root } => (*root, true),
        };
        CatalogEntry {
            name: self.name.clone(),
            param_id: self.param_id,
            root,
            checkpoint: self.checkpoint.load(Ordering::Acquire),
            deleted,
        }
    }
}

/// Process-wide series registry
pub struct TreeRegistry {
    store: Arc<BlockStore>,
    wal: Option<Arc<InputLog>>,
    catalog: Catalog,
    tree_config: TreeConfig,
    names: SkipMap<String, ParamId>,
    series: SkipMap<ParamId, Arc<SeriesEntry>>,
    next_param_id: AtomicU64,
    write_gate: RwLock<()>,
    checkpointing: Mutex<()>,
    next_shard: AtomicUsize,
}

impl TreeRegistry {
    /// Create a registry with an empty catalog in `dir`
    pub fn create(
        dir: &Path,
        store: Arc<BlockStore>,
        wal: Option<Arc<InputLog>>,
        tree_config: TreeConfig,
    ) -> Result<Self> {
        let catalog = Catalog::create(dir)?;
        Ok(Self::assemble(store, wal, catalog, tree_config, 1))
    }

    /// Load the catalog in `dir` and reopen every committed tree. A tree
    /// that can't be opened only disables its own series.
    pub fn open(
        dir: &Path,
        store: Arc<BlockStore>,
        wal: Option<Arc<InputLog>>,
        tree_config: TreeConfig,
    ) -> Result<Self> {
        let (catalog, state) = Catalog::open(dir)?;
        let registry = Self::assemble(store, wal, catalog, tree_config, state.next_param_id);

        for entry in state.entries {
            let series_state = if entry.deleted {
                SeriesState::Deleted { root: entry.root }
            } else {
                let tree = match entry.root {
                    Some(root) => NBTree::open(
                        entry.param_id,
                        registry.store.clone(),
                        tree_config,
                        root,
                    ),
                    None => Ok(NBTree::new(entry.param_id, registry.store.clone(), tree_config)),
                };
                match tree {
                    Ok(tree) => SeriesState::Live(Arc::new(tree)),
                    Err(e) => {
                        error!(
                            param_id = entry.param_id,
                            series = %entry.name,
                            "Series tree is unreadable: {}",
                            e
                        );
                        SeriesState::Broken {
                            root: entry.root,
                            reason: e.to_string(),
                        }
                    }
                }
            };

            if !entry.deleted {
                registry.names.insert(entry.name.clone(), entry.param_id);
            }
            registry.series.insert(
                entry.param_id,
                Arc::new(SeriesEntry {
                    name: entry.name,
                    param_id: entry.param_id,
                    state: series_state,
                    checkpoint: AtomicU64::new(entry.checkpoint),
                }),
            );
        }

        info!("Registry opened with {} series", registry.names.len());
        Ok(registry)
    }

    fn assemble(
        store: Arc<BlockStore>,
        wal: Option<Arc<InputLog>>,
        catalog: Catalog,
        tree_config: TreeConfig,
        next_param_id: ParamId,
    ) -> Self {
        Self {
            store,
            wal,
            catalog,
            tree_config,
            names: SkipMap::new(),
            series: SkipMap::new(),
            next_param_id: AtomicU64::new(next_param_id.max(1)),
            write_gate: RwLock::new(()),
            checkpointing: Mutex::new(()),
            next_shard: AtomicUsize::new(0),
        }
    }

    /// ParamId of `name`, creating the series on first sight
    pub fn resolve(&self, name: &SeriesName) -> Result<ParamId> {
        let canonical = name.canonical();
        if let Some(entry) = self.names.get(&canonical) {
            return Ok(*entry.value());
        }

        let mut journal = self.catalog.journal();
        if let Some(entry) = self.names.get(&canonical) {
            return Ok(*entry.value());
        }

        let param_id = self.next_param_id.fetch_add(1, Ordering::SeqCst);
        journal.created(&canonical, param_id)?;

        let tree = NBTree::new(param_id, self.store.clone(), self.tree_config);
        self.series.insert(
            param_id,
            Arc::new(SeriesEntry {
                name: canonical.clone(),
                param_id,
                state: SeriesState::Live(Arc::new(tree)),
                checkpoint: AtomicU64::new(0),
            }),
        );
        self.names.insert(canonical.clone(), param_id);
        info!(param_id, series = %canonical, "Created series");
        Ok(param_id)
    }

    /// ParamId of an existing series
    pub fn lookup(&self, name: &SeriesName) -> Option<ParamId> {
        self.names.get(&name.canonical()).map(|e| *e.value())
    }

    /// Canonical name of a series
    pub fn series_name(&self, param_id: ParamId) -> Option<String> {
        self.series.get(&param_id).map(|e| e.value().name.clone())
    }

    /// Tree of a live series
    pub fn get_tree(&self, param_id: ParamId) -> Result<Arc<NBTree>> {
        let entry = self
            .series
            .get(&param_id)
            .ok_or_else(|| RidgeError::SeriesNotFound(format!("param id {}", param_id)))?;
        let entry = entry.value();
        match &entry.state {
            SeriesState::Live(tree) => Ok(tree.clone()),
            SeriesState::Broken { reason, .. } => Err(RidgeError::Catalog(format!(
                "series {} is unavailable: {}",
                entry.name, reason
            ))),
            SeriesState::Deleted { .. } => Err(RidgeError::SeriesNotFound(entry.name.clone())),
        }
    }

    /// New ingestion session with its own name cache
    pub fn create_dispatcher(self: &Arc<Self>) -> Dispatcher {
        let shards = self.wal.as_ref().map_or(1, |w| w.shard_count());
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % shards;
        Dispatcher::new(self.clone(), shard)
    }

    /// Log a sample, then append it to its tree
    pub(crate) fn write(
        &self,
        shard: usize,
        param_id: ParamId,
        timestamp: Timestamp,
        value: Value,
    ) -> Result<WriteStatus> {
        let _gate = self.write_gate.read();
        let tree = self.get_tree(param_id)?;
        match &self.wal {
            Some(wal) => tree.append_logged(timestamp, value, || {
                wal.append(shard, param_id, timestamp, value)
            }),
            None => tree.append(timestamp, value),
        }
    }

    /// Delete a series. Its ParamId is never handed out again.
    pub fn remove_series(&self, name: &SeriesName) -> Result<ParamId> {
        let canonical = name.canonical();
        let _gate = self.write_gate.write();
        let mut journal = self.catalog.journal();

        let param_id = self
            .names
            .get(&canonical)
            .map(|e| *e.value())
            .ok_or_else(|| RidgeError::SeriesNotFound(canonical.clone()))?;
        let old = self
            .series
            .get(&param_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RidgeError::Internal(format!("series {} has no entry", param_id)))?;

        journal.deleted(param_id)?;
        let root = old.to_catalog().root;
        self.names.remove(&canonical);
        self.series.insert(
            param_id,
            Arc::new(SeriesEntry {
                name: canonical.clone(),
                param_id,
                state: SeriesState::Deleted { root },
                checkpoint: AtomicU64::new(old.checkpoint.load(Ordering::Acquire)),
            }),
        );
        info!(param_id, series = %canonical, "Deleted series");
        Ok(param_id)
    }

    /// Feed logged records back into their trees. Records already contained
    /// in a series' committed root are skipped, as are records of deleted or
    /// unreadable series.
    pub fn replay(&self, replay: WalReplay) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        for record in replay {
            let record = record?;
            let Some(entry) = self.series.get(&record.param_id).map(|e| e.value().clone()) else {
                warn!(param_id = record.param_id, "WAL record for unknown series");
                stats.skipped += 1;
                continue;
            };
            if record.seq <= entry.checkpoint.load(Ordering::Acquire) {
                stats.skipped += 1;
                continue;
            }
            match &entry.state {
                SeriesState::Live(tree) => {
                    let status = tree.append_logged(record.timestamp, record.value, || Ok(record.seq))?;
                    if status == WriteStatus::LateWrite {
                        stats.late_writes += 1;
                    }
                    stats.replayed += 1;
                }
                _ => stats.skipped += 1,
            }
        }
        info!(
            "WAL replay: {} records applied, {} skipped",
            stats.replayed, stats.skipped
        );
        Ok(stats)
    }

    /// Commit every changed tree, persist the catalog and advance the WAL
    /// checkpoint.
    ///
    /// The WAL position is read first. Each tree commit waits for writes in
    /// flight on that tree, so its root holds every record of the series up
    /// to that position. A series whose commit fails keeps its previous
    /// checkpoint and holds the WAL checkpoint back so its records stay
    /// replayable.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let _running = self.checkpointing.lock();
        let upto = self.wal.as_ref().map_or(0, |w| w.last_sequence());
        let mut stats = CheckpointStats {
            upto,
            ..Default::default()
        };
        let mut hold_back: Option<SequenceNumber> = None;

        for item in self.series.iter() {
            let entry = item.value();
            let SeriesState::Live(tree) = &entry.state else {
                continue;
            };
            match tree.commit() {
                Ok(commit) => {
                    if commit.written {
                        stats.committed += 1;
                    }
                    entry.checkpoint.fetch_max(commit.seq.max(upto), Ordering::AcqRel);
                }
                Err(e) => {
                    error!(param_id = entry.param_id, "Commit failed: {}", e);
                    stats.failed += 1;
                    let cp = entry.checkpoint.load(Ordering::Acquire);
                    hold_back = Some(hold_back.map_or(cp, |h| h.min(cp)));
                }
            }
        }

        self.store.flush()?;
        {
            let mut journal = self.catalog.journal();
            let entries = self.series.iter().map(|e| e.value().to_catalog()).collect();
            let next = self.next_param_id.load(Ordering::SeqCst);
            self.catalog.save(&mut journal, entries, next)?;
        }

        if let Some(wal) = &self.wal {
            wal.sync()?;
            let upto = hold_back.map_or(upto, |h| h.min(upto));
            wal.checkpoint(upto)?;
            stats.upto = upto;
        }

        info!(
            "Checkpoint at sequence {}: {} trees committed, {} failed",
            stats.upto, stats.committed, stats.failed
        );
        Ok(stats)
    }

    /// Live series names and ids
    pub fn list(&self) -> Vec<(String, ParamId)> {
        self.names
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Number of live series
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Per-series state for the debug report
    pub fn report(&self) -> Vec<SeriesReport> {
        self.series
            .iter()
            .map(|item| {
                let entry = item.value();
                let catalog = entry.to_catalog();
                let (status, tree, error) = match &entry.state {
                    SeriesState::Live(tree) => ("live", Some(tree.stats()), None),
                    SeriesState::Broken { reason, .. } => ("broken", None, Some(reason.clone())),
                    SeriesState::Deleted { .. } => ("deleted", None, None),
                };
                SeriesReport {
                    name: catalog.name,
                    param_id: catalog.param_id,
                    status,
                    root: catalog.root.map(|r| r.to_string()),
                    checkpoint: catalog.checkpoint,
                    tree,
                    error,
                }
            })
            .collect()
    }
}

/// Outcome of a WAL replay
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub replayed: u64,
    pub skipped: u64,
    pub late_writes: u64,
}

/// Outcome of a checkpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointStats {
    /// WAL sequence the log was checkpointed at
    pub upto: SequenceNumber,
    pub committed: usize,
    pub failed: usize,
}

/// One series in the debug report
#[derive(Debug, Clone, Serialize)]
pub struct SeriesReport {
    pub name: String,
    pub param_id: ParamId,
    pub status: &'static str,
    pub root: Option<String>,
    pub checkpoint: SequenceNumber,
    pub tree: Option<TreeStats>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{BlockStoreConfig, StoreMode};
    use crate::wal::{SyncPolicy, WalConfig};
    use crate::TimeRange;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        dir: TempDir,
        db_id: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db_id = Uuid::new_v4();
            let config = BlockStoreConfig {
                volumes: 2,
                volume_size: 512 * 4096,
                mode: StoreMode::Fixed,
                allocate: false,
            };
            BlockStore::create(&dir.path().join("blocks"), &config, db_id).unwrap();
            InputLog::create(&Self::wal_config(&dir), db_id).unwrap();
            Catalog::create(&dir.path().join("catalog")).unwrap();
            Self { dir, db_id }
        }

        fn wal_config(dir: &TempDir) -> WalConfig {
            WalConfig {
                dir: dir.path().join("wal"),
                shards: 2,
                volumes: 4,
                volume_size: 1 << 20,
                sync_policy: SyncPolicy::None,
            }
        }

        /// Open everything and replay the log, as a restart does
        fn open(&self) -> Arc<TreeRegistry> {
            let store = Arc::new(BlockStore::open(&self.dir.path().join("blocks")).unwrap());
            let wal = Arc::new(InputLog::open(&Self::wal_config(&self.dir), self.db_id).unwrap());
            let registry = TreeRegistry::open(
                &self.dir.path().join("catalog"),
                store,
                Some(wal.clone()),
                TreeConfig {
                    tail_capacity: 16,
                    fanout: 4,
                },
            )
            .unwrap();
            registry.replay(wal.replay().unwrap()).unwrap();
            Arc::new(registry)
        }
    }

    fn values(registry: &TreeRegistry, name: &str) -> Vec<(Timestamp, Value)> {
        let id = registry.lookup(&SeriesName::parse(name).unwrap()).unwrap();
        registry
            .get_tree(id)
            .unwrap()
            .iterate(TimeRange::all())
            .map(|s| s.map(|s| (s.timestamp, s.value)))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_concurrent_first_sight_resolves_once() {
        let fixture = Fixture::new();
        let registry = fixture.open();
        let name = SeriesName::parse("host=a metric=cpu").unwrap();

        let ids: Vec<ParamId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.resolve(&name).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(registry.len(), 1);

        drop(registry);
        let state = Catalog::read(&fixture.dir.path().join("catalog")).unwrap();
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    fn test_replay_restores_unchecked_writes() {
        let fixture = Fixture::new();
        {
            let registry = fixture.open();
            let mut dispatcher = registry.create_dispatcher();
            for i in 0..100u64 {
                dispatcher.write(b"cpu host=a", i, Value::Float(i as f64)).unwrap();
                if i == 60 {
                    registry.checkpoint().unwrap();
                }
            }
            for i in 0..10u64 {
                dispatcher.write(b"mem host=a", i, Value::Integer(i as i64)).unwrap();
            }
            // crash: no final checkpoint
        }

        let registry = fixture.open();
        let cpu = values(&registry, "cpu host=a");
        assert_eq!(cpu.len(), 100);
        assert!(cpu.iter().enumerate().all(|(i, (ts, v))| *ts == i as u64 && *v == Value::Float(i as f64)));
        assert_eq!(values(&registry, "mem host=a").len(), 10);

        // replaying again after a clean checkpoint changes nothing
        registry.checkpoint().unwrap();
        drop(registry);
        let registry = fixture.open();
        assert_eq!(values(&registry, "cpu host=a").len(), 100);
    }

    #[test]
    fn test_parallel_writers_survive_checkpoints_and_crash() {
        let fixture = Fixture::new();
        {
            let registry = fixture.open();
            std::thread::scope(|s| {
                for writer in 0..4u64 {
                    let registry = &registry;
                    s.spawn(move || {
                        let mut dispatcher = registry.create_dispatcher();
                        let name = format!("cpu host={}", writer);
                        for ts in 0..500u64 {
                            dispatcher
                                .write(name.as_bytes(), ts, Value::Integer(ts as i64))
                                .unwrap();
                        }
                    });
                }
                s.spawn(|| {
                    for _ in 0..20 {
                        registry.checkpoint().unwrap();
                    }
                });
            });
            // crash: whatever came after the last checkpoint is only in the log
        }

        let registry = fixture.open();
        for writer in 0..4u64 {
            let samples = values(&registry, &format!("cpu host={}", writer));
            assert_eq!(samples.len(), 500);
            assert!(samples
                .iter()
                .enumerate()
                .all(|(i, (ts, v))| *ts == i as u64 && *v == Value::Integer(i as i64)));
        }
    }

    #[test]
    fn test_remove_series_never_reuses_id() {
        let fixture = Fixture::new();
        let registry = fixture.open();
        let name = SeriesName::parse("cpu host=a").unwrap();
        let mut dispatcher = registry.create_dispatcher();

        let first = dispatcher.init_series_id(b"cpu host=a").unwrap();
        dispatcher.write_sample(first, 1, Value::Float(1.0)).unwrap();
        assert_eq!(registry.remove_series(&name).unwrap(), first);
        assert!(registry.get_tree(first).is_err());
        assert!(registry.remove_series(&name).is_err());

        // the stale cache entry is dropped and the name gets a new id
        dispatcher.write(b"cpu host=a", 2, Value::Float(2.0)).unwrap();
        let second = registry.lookup(&name).unwrap();
        assert_ne!(first, second);

        drop(dispatcher);
        drop(registry);
        let registry = fixture.open();
        assert_eq!(registry.lookup(&name), Some(second));
        assert_eq!(values(&registry, "cpu host=a"), vec![(2, Value::Float(2.0))]);
    }

    #[test]
    fn test_unreadable_tree_is_isolated() {
        let fixture = Fixture::new();
        let broken_root = {
            let registry = fixture.open();
            let mut dispatcher = registry.create_dispatcher();
            for i in 0..40u64 {
                dispatcher.write(b"cpu host=a", i, Value::Float(1.0)).unwrap();
                dispatcher.write(b"cpu host=b", i, Value::Float(2.0)).unwrap();
            }
            registry.checkpoint().unwrap();
            let id = registry.lookup(&SeriesName::parse("cpu host=a").unwrap()).unwrap();
            registry.get_tree(id).unwrap().root().unwrap()
        };

        let store = BlockStore::open(&fixture.dir.path().join("blocks")).unwrap();
        store.write(broken_root, b"not a node").unwrap();
        store.flush().unwrap();
        drop(store);

        let registry = fixture.open();
        let a = registry.lookup(&SeriesName::parse("cpu host=a").unwrap()).unwrap();
        assert!(registry.get_tree(a).is_err());
        assert_eq!(values(&registry, "cpu host=b").len(), 40);

        let mut dispatcher = registry.create_dispatcher();
        assert!(dispatcher.write(b"cpu host=a", 100, Value::Float(1.0)).is_err());
        assert!(dispatcher.write(b"cpu host=b", 100, Value::Float(1.0)).is_ok());
        assert!(registry.report().iter().any(|r| r.status == "broken"));
    }
}
