//! Database - one block store, its catalog and its write-ahead log

use super::{Checkpointer, DatabaseConfig};
use crate::blockstore::{BlockStore, BlockStoreStats};
use crate::query::QueryProcessor;
use crate::registry::{
    Catalog, CatalogEntry, CheckpointStats, Dispatcher, ReplayStats, SeriesReport, TreeRegistry,
};
use crate::wal::{InputLog, WalStats};
use crate::{ParamId, Result, RidgeError, SequenceNumber};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// An open Ridgeline database
pub struct Database {
    config: DatabaseConfig,
    store: Arc<BlockStore>,
    wal: Option<Arc<InputLog>>,
    registry: Arc<TreeRegistry>,
    checkpointer: Mutex<Option<Checkpointer>>,
    recovered: ReplayStats,
    closed: AtomicBool,
}

impl Database {
    /// Allocate the volumes, an empty catalog and the WAL of a new database
    pub fn create(config: &DatabaseConfig) -> Result<()> {
        if BlockStore::exists(&config.blocks_dir()) {
            return Err(RidgeError::Config(format!(
                "database already exists in {:?}",
                config.path
            )));
        }
        let db_id = Uuid::new_v4();

        BlockStore::create(&config.blocks_dir(), &config.block_store(), db_id)?;
        Catalog::create(&config.catalog_dir())?;
        if let Some(wal) = &config.wal {
            InputLog::create(wal, db_id)?;
        }

        info!(db_id = %db_id, "Created database in {:?}", config.path);
        Ok(())
    }

    /// Open a database and replay whatever its WAL holds beyond the last
    /// checkpoint
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let store = Arc::new(BlockStore::open(&config.blocks_dir())?);
        let db_id = store.db_id();

        let wal = match &config.wal {
            Some(wal_config) if InputLog::exists(&wal_config.dir) => {
                Some(Arc::new(InputLog::open(wal_config, db_id)?))
            }
            Some(wal_config) => {
                // Series checkpoints in the catalog refer to the old log's
                // numbering; the new log has to count on from the highest
                let start = Catalog::read(&config.catalog_dir())?
                    .entries
                    .iter()
                    .map(|e| e.checkpoint)
                    .max()
                    .unwrap_or(0);
                info!(start, "No WAL in {:?}, starting a new one", wal_config.dir);
                Some(Arc::new(InputLog::create_after(wal_config, db_id, start)?))
            }
            None => None,
        };

        let registry = Arc::new(TreeRegistry::open(
            &config.catalog_dir(),
            store.clone(),
            wal.clone(),
            config.tree(),
        )?);

        let mut recovered = ReplayStats::default();
        if let Some(wal) = &wal {
            recovered = registry.replay(wal.replay()?)?;
            if recovered.replayed > 0 {
                registry.checkpoint()?;
            }
        }

        let checkpointer = match config.checkpoint_interval() {
            Some(interval) => Some(Checkpointer::start(registry.clone(), interval)?),
            None => None,
        };

        info!(
            db_id = %db_id,
            series = registry.len(),
            wal = wal.is_some(),
            "Opened database in {:?}",
            config.path
        );
        Ok(Self {
            config,
            store,
            wal,
            registry,
            checkpointer: Mutex::new(checkpointer),
            recovered,
            closed: AtomicBool::new(false),
        })
    }

    /// Delete every file of a database. A database that still holds live
    /// series is only deleted with `force`.
    pub fn remove(config: &DatabaseConfig, force: bool) -> Result<()> {
        let catalog_dir = config.catalog_dir();
        if !BlockStore::exists(&config.blocks_dir()) && !Catalog::exists(&catalog_dir) {
            return Err(RidgeError::Config(format!("no database in {:?}", config.path)));
        }

        if Catalog::exists(&catalog_dir) {
            match Catalog::read(&catalog_dir) {
                Ok(state) => {
                    let live = state.entries.iter().filter(|e| !e.deleted).count();
                    if live > 0 && !force {
                        return Err(RidgeError::Config(format!(
                            "database holds {} series, use force to delete it",
                            live
                        )));
                    }
                }
                Err(e) if force => warn!("Deleting database with unreadable catalog: {}", e),
                Err(e) => return Err(e),
            }
        }

        for dir in [config.blocks_dir(), catalog_dir] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        if let Some(wal_dir) = config.wal_dir() {
            InputLog::remove(wal_dir)?;
        }
        // Only succeeds when nothing else lives there
        let _ = fs::remove_dir(&config.path);

        info!("Removed database in {:?}", config.path);
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TreeRegistry> {
        &self.registry
    }

    /// What the WAL replay at open time did
    pub fn recovered(&self) -> &ReplayStats {
        &self.recovered
    }

    /// New ingestion session
    pub fn create_session(&self) -> Dispatcher {
        self.registry.create_dispatcher()
    }

    pub fn query_processor(&self) -> QueryProcessor {
        QueryProcessor::new(self.registry.clone(), self.config.read_buffer)
    }

    /// Commit every tree and advance the WAL checkpoint now
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        self.registry.checkpoint()
    }

    /// Ask the background checkpointer to run soon. Front ends call this
    /// when writes hit backpressure.
    pub fn request_checkpoint(&self) {
        match self.checkpointer.lock().as_ref() {
            Some(checkpointer) => checkpointer.request(),
            None => {
                if let Err(e) = self.registry.checkpoint() {
                    error!("Checkpoint failed: {}", e);
                }
            }
        }
    }

    /// Stop background work and make everything durable. Further calls
    /// are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut checkpointer) = self.checkpointer.lock().take() {
            checkpointer.stop()?;
        }
        let stats = self.registry.checkpoint()?;
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        info!(
            "Closed database in {:?} at sequence {}",
            self.config.path, stats.upto
        );
        Ok(())
    }

    /// State of the open database
    pub fn debug_report(&self) -> DebugReport {
        DebugReport {
            path: self.config.path.display().to_string(),
            series_count: self.registry.len(),
            block_store: self.store.stats(),
            wal: self.wal.as_ref().map(|w| w.stats()),
            series: self.registry.report(),
        }
    }

    /// What opening the database in `config` would recover, computed
    /// without modifying any file
    pub fn recovery_report(config: &DatabaseConfig) -> Result<RecoveryReport> {
        let store = BlockStore::open(&config.blocks_dir())?;
        let catalog = Catalog::read(&config.catalog_dir())?;

        let mut report = RecoveryReport {
            path: config.path.display().to_string(),
            block_store: store.stats(),
            next_param_id: catalog.next_param_id,
            catalog: catalog.entries,
            wal: None,
            pending: Vec::new(),
            orphaned: 0,
        };

        let Some(wal_dir) = config.wal_dir().filter(|d| InputLog::exists(d)) else {
            return Ok(report);
        };
        let (stats, replay) = InputLog::inspect(wal_dir)?;

        let entries: BTreeMap<ParamId, &CatalogEntry> =
            report.catalog.iter().map(|e| (e.param_id, e)).collect();
        let mut pending: BTreeMap<ParamId, PendingSeries> = BTreeMap::new();
        let mut orphaned = 0;
        for record in replay {
            let record = record?;
            match entries.get(&record.param_id) {
                Some(entry) if !entry.deleted => {
                    if record.seq <= entry.checkpoint {
                        continue;
                    }
                    let series = pending.entry(record.param_id).or_insert_with(|| PendingSeries {
                        name: entry.name.clone(),
                        param_id: record.param_id,
                        records: 0,
                        first_seq: record.seq,
                        last_seq: record.seq,
                    });
                    series.records += 1;
                    series.first_seq = series.first_seq.min(record.seq);
                    series.last_seq = series.last_seq.max(record.seq);
                }
                _ => orphaned += 1,
            }
        }

        report.wal = Some(stats);
        report.pending = pending.into_values().collect();
        report.orphaned = orphaned;
        Ok(report)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close database: {}", e);
        }
    }
}

/// Debug dump of an open database
#[derive(Debug, Serialize)]
pub struct DebugReport {
    pub path: String,
    pub series_count: usize,
    pub block_store: BlockStoreStats,
    pub wal: Option<WalStats>,
    pub series: Vec<SeriesReport>,
}

/// Debug dump of a database at rest
#[derive(Debug, Serialize)]
pub struct RecoveryReport {
    pub path: String,
    pub block_store: BlockStoreStats,
    pub next_param_id: ParamId,
    pub catalog: Vec<CatalogEntry>,
    pub wal: Option<WalStats>,
    /// Records a restart would replay, per series
    pub pending: Vec<PendingSeries>,
    /// Records of unknown or deleted series
    pub orphaned: u64,
}

#[derive(Debug, Serialize)]
pub struct PendingSeries {
    pub name: String,
    pub param_id: ParamId,
    pub records: u64,
    pub first_seq: SequenceNumber,
    pub last_seq: SequenceNumber,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{SyncPolicy, WalConfig};
    use crate::{SeriesName, TimeRange, Value};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig {
            volumes: 2,
            volume_size: 256 * 4096,
            tail_capacity: 16,
            fanout: 4,
            checkpoint_interval: 0,
            ..DatabaseConfig::new(dir.path().join("db"))
        }
        .with_wal(Some(WalConfig {
            dir: dir.path().join("wal"),
            shards: 2,
            volumes: 4,
            volume_size: 1 << 20,
            sync_policy: SyncPolicy::Immediate,
        }))
    }

    fn count(db: &Database, name: &str) -> usize {
        let name = SeriesName::parse(name).unwrap();
        let id = db.registry().lookup(&name).unwrap();
        db.registry()
            .get_tree(id)
            .unwrap()
            .iterate(TimeRange::all())
            .count()
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Database::create(&config).unwrap();
        assert!(matches!(Database::create(&config), Err(RidgeError::Config(_))));
    }

    #[test]
    fn test_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Database::create(&config).unwrap();

        {
            let db = Database::open(config.clone()).unwrap();
            let mut session = db.create_session();
            for ts in 0..100u64 {
                session.write(b"cpu host=a", ts, Value::Float(ts as f64)).unwrap();
            }
            db.close().unwrap();
            db.close().unwrap();
        }

        let db = Database::open(config).unwrap();
        assert_eq!(db.recovered().replayed, 0);
        assert_eq!(count(&db, "cpu host=a"), 100);
    }

    #[test]
    fn test_crash_recovery_replays_wal() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Database::create(&config).unwrap();

        let db = Database::open(config.clone()).unwrap();
        let mut session = db.create_session();
        for ts in 0..40u64 {
            session.write(b"cpu host=a", ts, Value::Integer(ts as i64)).unwrap();
        }
        db.checkpoint().unwrap();
        for ts in 40..70u64 {
            session.write(b"cpu host=a", ts, Value::Integer(ts as i64)).unwrap();
        }
        drop(session);
        // Simulated crash: no close, no checkpoint
        std::mem::forget(db);

        let report = Database::recovery_report(&config).unwrap();
        assert_eq!(report.pending.len(), 1);
        assert_eq!(report.pending[0].records, 30);
        assert_eq!(report.orphaned, 0);

        let db = Database::open(config).unwrap();
        assert_eq!(db.recovered().replayed, 30);
        assert_eq!(count(&db, "cpu host=a"), 70);
    }

    #[test]
    fn test_recreated_wal_keeps_new_writes() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Database::create(&config).unwrap();

        {
            let db = Database::open(config.clone()).unwrap();
            let mut session = db.create_session();
            for ts in 0..100u64 {
                session.write(b"cpu host=a", ts, Value::Float(1.0)).unwrap();
            }
            db.close().unwrap();
        }
        fs::remove_dir_all(dir.path().join("wal")).unwrap();

        let db = Database::open(config.clone()).unwrap();
        let mut session = db.create_session();
        for ts in 100..110u64 {
            session.write(b"cpu host=a", ts, Value::Float(1.0)).unwrap();
        }
        drop(session);
        std::mem::forget(db);

        let db = Database::open(config).unwrap();
        assert_eq!(db.recovered().replayed, 10);
        assert_eq!(count(&db, "cpu host=a"), 110);
    }

    #[test]
    fn test_remove_requires_force() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Database::create(&config).unwrap();
        {
            let db = Database::open(config.clone()).unwrap();
            db.create_session().write(b"mem", 1, Value::Integer(1)).unwrap();
        }

        assert!(Database::remove(&config, false).is_err());
        Database::remove(&config, true).unwrap();
        assert!(!config.path.exists());
        assert!(!dir.path().join("wal").exists());
        assert!(Database::remove(&config, true).is_err());
    }

    #[test]
    fn test_debug_report_is_json() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Database::create(&config).unwrap();
        let db = Database::open(config).unwrap();
        db.create_session().write(b"cpu host=a", 5, Value::Float(1.5)).unwrap();

        let json = serde_json::to_value(db.debug_report()).unwrap();
        assert_eq!(json["series_count"], 1);
        assert_eq!(json["series"][0]["name"], "cpu host=a");
        assert_eq!(json["series"][0]["status"], "live");
        assert_eq!(json["wal"]["shards"].as_array().unwrap().len(), 2);
    }
}
