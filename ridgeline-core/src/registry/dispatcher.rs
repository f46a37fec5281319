//! Per-session ingestion front end

use super::TreeRegistry;
use crate::{ParamId, Result, RidgeError, SeriesName, Timestamp, Value, WriteStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Cached names per session before the cache is reset
const CACHE_LIMIT: usize = 100_000;

/// Ingestion session.
///
/// Keeps its own name cache so that repeated writes to the same series never
/// touch the registry's maps. Not shared between threads; every connection or
/// worker creates its own.
pub struct Dispatcher {
    registry: Arc<TreeRegistry>,
    cache: HashMap<Vec<u8>, ParamId>,
    shard: usize,
}

impl Dispatcher {
    pub(super) fn new(registry: Arc<TreeRegistry>, shard: usize) -> Self {
        Self {
            registry,
            cache: HashMap::new(),
            shard,
        }
    }

    /// WAL shard this session appends to
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn registry(&self) -> &Arc<TreeRegistry> {
        &self.registry
    }

    /// Resolve a series name, creating the series on first sight
    pub fn init_series_id(&mut self, name: &[u8]) -> Result<ParamId> {
        if let Some(id) = self.cache.get(name) {
            return Ok(*id);
        }
        let parsed = SeriesName::parse_bytes(name)?;
        let id = self.registry.resolve(&parsed)?;
        if self.cache.len() >= CACHE_LIMIT {
            self.cache.clear();
        }
        self.cache.insert(name.to_vec(), id);
        Ok(id)
    }

    /// Write a sample of a named series
    pub fn write(&mut self, name: &[u8], timestamp: Timestamp, value: Value) -> Result<WriteStatus> {
        let id = self.init_series_id(name)?;
        match self.write_sample(id, timestamp, value) {
            Err(RidgeError::SeriesNotFound(_)) => {
                // Deleted since it was cached
                debug!(param_id = id, "Dropping stale cache entry");
                self.cache.remove(name);
                let id = self.init_series_id(name)?;
                self.write_sample(id, timestamp, value)
            }
            other => other,
        }
    }

    /// Write a sample of an already resolved series
    pub fn write_sample(&self, param_id: ParamId, timestamp: Timestamp, value: Value) -> Result<WriteStatus> {
        self.registry.write(self.shard, param_id, timestamp, value)
    }
}
