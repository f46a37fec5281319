//! Per-series indexed tree ("NBTree")
//!
//! Samples accumulate in an in-memory tail. A full tail is sorted, compressed
//! into one or more leaves and appended to the block store. Leaf references
//! collect in a per-level buffer; when a level reaches the fanout its buffer
//! is sealed into an inner node one level up. Nothing is ever rewritten.
//!
//! `commit()` persists the open level buffers as partial inner nodes and
//! writes a root node that references them and carries the tail, so a tree
//! is fully described by its last root address. Partial nodes that did not
//! change since the previous commit are referenced again instead of being
//! rewritten.
//!
//! Appenders are serialized by the writer lock. Block I/O runs without the
//! state lock; the new levels are swapped in once their blocks are written,
//! so readers never see a half-sealed tail.

mod cursor;
mod node;

pub use cursor::{CursorPos, TreeCursor};
pub use node::{
    ChildRef, Inner, Leaf, Root, RootTail, Rollup, INNER_CAPACITY, LEAF_DATA_CAPACITY,
};

use crate::blockstore::{BlockAddr, BlockStore, MAX_PAYLOAD_SIZE};
use crate::compression::GorillaDecoder;
use crate::{
    ParamId, Result, RidgeError, SequenceNumber, TimeRange, Timestamp, Value, WriteStatus,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest tail a root can always describe
pub const MAX_TAIL_CAPACITY: usize = 16 * 1024;

/// Tree tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Tail samples buffered before a leaf is written
    pub tail_capacity: usize,
    /// Children per inner node
    pub fanout: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            tail_capacity: crate::config::TAIL_CAPACITY,
            fanout: crate::config::TREE_FANOUT,
        }
    }
}

struct TreeState {
    tail: Vec<(Timestamp, Value)>,
    /// `levels[k]` references nodes of height `k` (leaves are height 0)
    levels: Vec<Vec<ChildRef>>,
    last_timestamp: Option<Timestamp>,
    /// WAL sequence of the newest applied record
    last_seq: SequenceNumber,
    root: Option<BlockAddr>,
    committed_seq: SequenceNumber,
    /// Bumped by every append
    version: u64,
    committed_version: u64,
}

impl TreeState {
    fn is_dirty(&self) -> bool {
        self.root.is_none() || self.version != self.committed_version
    }
}

/// Partial inner node written by an earlier commit
#[derive(Clone, Copy)]
struct Partial {
    len: usize,
    last: BlockAddr,
    node: ChildRef,
}

/// Result of [`NBTree::commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub root: BlockAddr,
    /// Every record with a sequence number up to this one is reachable
    /// from `root`
    pub seq: SequenceNumber,
    /// False when nothing changed and the previous root was returned
    pub written: bool,
}

/// Append-only index over one series
pub struct NBTree {
    param_id: ParamId,
    store: Arc<BlockStore>,
    config: TreeConfig,
    state: RwLock<TreeState>,
    writer: Mutex<()>,
    /// Serializes commits and remembers the partial nodes they wrote
    partials: Mutex<Vec<Option<Partial>>>,
}

impl NBTree {
    /// Create an empty tree
    pub fn new(param_id: ParamId, store: Arc<BlockStore>, config: TreeConfig) -> Self {
        Self {
            param_id,
            store,
            config: clamp(config),
            state: RwLock::new(TreeState {
                tail: Vec::new(),
                levels: Vec::new(),
                last_timestamp: None,
                last_seq: 0,
                root: None,
                committed_seq: 0,
                version: 0,
                committed_version: 0,
            }),
            writer: Mutex::new(()),
            partials: Mutex::new(Vec::new()),
        }
    }

    /// Restore a tree from a committed root
    pub fn open(
        param_id: ParamId,
        store: Arc<BlockStore>,
        config: TreeConfig,
        root_addr: BlockAddr,
    ) -> Result<Self> {
        let root = Root::decode(root_addr, &store.read(root_addr)?)?;
        if root.param_id != param_id {
            return Err(RidgeError::corruption(
                root_addr,
                format!("root belongs to series {}, expected {}", root.param_id, param_id),
            ));
        }

        let mut levels = Vec::with_capacity(root.levels.len());
        let mut partials = Vec::with_capacity(root.levels.len());
        for (height, level) in root.levels.iter().enumerate() {
            let (refs, partial) = match level {
                Some(child) => {
                    let inner = read_inner(&store, param_id, child.addr)?;
                    if inner.level as usize != height + 1 {
                        return Err(RidgeError::corruption(child.addr, "unexpected node level"));
                    }
                    let partial = inner.children.last().map(|last| Partial {
                        len: inner.children.len(),
                        last: last.addr,
                        node: *child,
                    });
                    (inner.children, partial)
                }
                None => (Vec::new(), None),
            };
            levels.push(refs);
            partials.push(partial);
        }

        let tail = match &root.tail {
            RootTail::Inline { count, data } => {
                GorillaDecoder::new(data, *count as usize).decode_all()?
            }
            RootTail::Leaves(addrs) => {
                let mut tail = Vec::new();
                for addr in addrs {
                    tail.extend(read_leaf(&store, param_id, *addr)?.samples()?);
                }
                tail
            }
        };

        debug!(
            param_id,
            root = %root_addr,
            levels = levels.len(),
            tail = tail.len(),
            "Opened tree"
        );
        Ok(Self {
            param_id,
            store,
            config: clamp(config),
            state: RwLock::new(TreeState {
                tail,
                levels,
                last_timestamp: root.last_timestamp,
                last_seq: 0,
                root: Some(root_addr),
                committed_seq: 0,
                version: 0,
                committed_version: 0,
            }),
            writer: Mutex::new(()),
            partials: Mutex::new(partials),
        })
    }

    pub fn param_id(&self) -> ParamId {
        self.param_id
    }

    /// Append a sample that is not tracked by a log
    pub fn append(&self, timestamp: Timestamp, value: Value) -> Result<WriteStatus> {
        self.append_logged(timestamp, value, || Ok(0))
    }

    /// Append a sample after `log` recorded it.
    ///
    /// `log` runs under the writer lock and returns the record's sequence
    /// number, so records reach the tree in sequence order. A sample older
    /// than the newest one seen is still stored and reported as
    /// `LateWrite`. When the tail is full it is sealed first; if that fails
    /// the sample is rejected before it is logged and the tail is kept for
    /// the next try.
    pub fn append_logged<F>(&self, timestamp: Timestamp, value: Value, log: F) -> Result<WriteStatus>
    where
        F: FnOnce() -> Result<SequenceNumber>,
    {
        let _writer = self.writer.lock();
        if self.state.read().tail.len() >= self.config.tail_capacity {
            self.seal_tail()?;
        }
        let seq = log()?;

        let mut state = self.state.write();
        let status = match state.last_timestamp {
            Some(last) if timestamp < last => {
                debug!(param_id = self.param_id, timestamp, last, "Late write");
                WriteStatus::LateWrite
            }
            _ => WriteStatus::Ok,
        };
        state.last_timestamp = Some(state.last_timestamp.map_or(timestamp, |l| l.max(timestamp)));
        state.last_seq = state.last_seq.max(seq);
        state.tail.push((timestamp, value));
        state.version += 1;
        Ok(status)
    }

    /// Seal the tail into leaves without committing a root
    pub fn flush(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.seal_tail()
    }

    /// Make everything appended so far reachable from a new root.
    ///
    /// Only the capture of the tree state waits for appenders; the blocks
    /// are written while appends continue.
    pub fn commit(&self) -> Result<Commit> {
        let mut partials = self.partials.lock();
        let (levels, mut tail, last_timestamp, seq, version) = {
            let _writer = self.writer.lock();
            let state = self.state.read();
            if let (false, Some(root)) = (state.is_dirty(), state.root) {
                return Ok(Commit {
                    root,
                    seq: state.committed_seq.max(state.last_seq),
                    written: false,
                });
            }
            (
                state.levels.clone(),
                state.tail.clone(),
                state.last_timestamp,
                state.last_seq,
                state.version,
            )
        };
        tail.sort_by_key(|(ts, _)| *ts);

        // Work on a copy so a failed write leaves the cache untouched
        let mut cache = partials.clone();
        cache.resize(levels.len(), None);
        let mut root_levels = Vec::with_capacity(levels.len());
        for (height, refs) in levels.iter().enumerate() {
            let Some(last) = refs.last() else {
                cache[height] = None;
                root_levels.push(None);
                continue;
            };
            let unchanged = cache[height].filter(|p| p.len == refs.len() && p.last == last.addr);
            if let Some(partial) = unchanged {
                root_levels.push(Some(partial.node));
                continue;
            }

            let inner = Inner {
                param_id: self.param_id,
                level: (height + 1) as u16,
                children: refs.clone(),
            };
            let node = ChildRef {
                addr: self.write_node(&inner.encode())?,
                rollup: inner.rollup(),
            };
            cache[height] = Some(Partial {
                len: refs.len(),
                last: last.addr,
                node,
            });
            root_levels.push(Some(node));
        }

        let mut root = Root {
            param_id: self.param_id,
            last_timestamp,
            levels: root_levels,
            tail: RootTail::inline(&tail),
        };
        let mut payload = root.encode();
        if payload.len() > MAX_PAYLOAD_SIZE {
            let mut addrs = Vec::new();
            for leaf in Leaf::build(self.param_id, &tail) {
                addrs.push(self.write_node(&leaf.encode())?);
            }
            root.tail = RootTail::Leaves(addrs);
            payload = root.encode();
        }
        let addr = self.write_node(&payload)?;
        *partials = cache;

        let mut state = self.state.write();
        state.root = Some(addr);
        state.committed_seq = seq;
        if state.version == version {
            state.committed_version = version;
        }
        debug!(param_id = self.param_id, root = %addr, seq, "Committed tree");
        Ok(Commit {
            root: addr,
            seq,
            written: true,
        })
    }

    /// Address of the last committed root
    pub fn root(&self) -> Option<BlockAddr> {
        self.state.read().root
    }

    /// Whether anything changed since the last commit
    pub fn is_dirty(&self) -> bool {
        self.state.read().is_dirty()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.state.read().last_timestamp
    }

    /// Lazily iterate samples in `range`
    pub fn iterate(&self, range: TimeRange) -> TreeCursor {
        let (nodes, tail) = self.snapshot();
        TreeCursor::new(self.param_id, self.store.clone(), range, nodes, tail, None)
    }

    /// Resume an iteration at a position returned by [`TreeCursor::position`]
    pub fn iterate_from(&self, range: TimeRange, pos: CursorPos) -> TreeCursor {
        let (nodes, tail) = self.snapshot();
        let range = TimeRange::new(range.start.max(pos.timestamp), range.end);
        TreeCursor::new(self.param_id, self.store.clone(), range, nodes, tail, Some(pos))
    }

    /// Summary of the samples in `range`, using subtree rollups where the
    /// whole subtree falls inside the range
    pub fn aggregate(&self, range: TimeRange) -> Result<Rollup> {
        let (nodes, tail) = self.snapshot();
        let mut acc = Rollup::empty();
        for (child, height) in nodes {
            self.fold(child, height, range, &mut acc)?;
        }
        for (ts, value) in tail.into_iter().filter(|(ts, _)| range.contains(*ts)) {
            acc.add(ts, value.as_f64());
        }
        Ok(acc)
    }

    /// Tree statistics
    pub fn stats(&self) -> TreeStats {
        let state = self.state.read();
        let stored: u64 = state
            .levels
            .iter()
            .flatten()
            .map(|child| child.rollup.count)
            .sum();
        TreeStats {
            param_id: self.param_id,
            root: state.root.map(|r| r.to_string()),
            levels: state.levels.iter().map(Vec::len).collect(),
            tail_len: state.tail.len(),
            samples: stored + state.tail.len() as u64,
            last_timestamp: state.last_timestamp,
            last_seq: state.last_seq,
            dirty: state.is_dirty(),
        }
    }

    /// Top-level nodes, oldest first, plus the sorted tail
    fn snapshot(&self) -> (Vec<(ChildRef, usize)>, Vec<(Timestamp, Value)>) {
        let state = self.state.read();
        let nodes = state
            .levels
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(height, refs)| refs.iter().map(move |child| (*child, height)))
            .collect();
        let mut tail = state.tail.clone();
        drop(state);
        tail.sort_by_key(|(ts, _)| *ts);
        (nodes, tail)
    }

    /// Write the tail as leaves. The caller holds the writer lock, so the
    /// tail can't change while the blocks are written.
    fn seal_tail(&self) -> Result<()> {
        let (mut sorted, mut levels) = {
            let state = self.state.read();
            if state.tail.is_empty() {
                return Ok(());
            }
            (state.tail.clone(), state.levels.clone())
        };
        sorted.sort_by_key(|(ts, _)| *ts);

        let leaves = Leaf::build(self.param_id, &sorted);
        let leaf_count = leaves.len();
        for leaf in leaves {
            let addr = self.write_node(&leaf.encode())?;
            self.push_ref(
                &mut levels,
                ChildRef {
                    addr,
                    rollup: leaf.rollup,
                },
            )?;
        }

        let mut state = self.state.write();
        state.levels = levels;
        state.tail.clear();
        drop(state);

        debug!(
            param_id = self.param_id,
            samples = sorted.len(),
            leaves = leaf_count,
            "Sealed tail"
        );
        Ok(())
    }

    fn push_ref(&self, levels: &mut Vec<Vec<ChildRef>>, leaf: ChildRef) -> Result<()> {
        let mut height = 0;
        let mut child = leaf;
        loop {
            if levels.len() <= height {
                levels.push(Vec::new());
            }
            levels[height].push(child);
            if levels[height].len() < self.config.fanout {
                return Ok(());
            }

            let inner = Inner {
                param_id: self.param_id,
                level: (height + 1) as u16,
                children: std::mem::take(&mut levels[height]),
            };
            let addr = self.write_node(&inner.encode())?;
            child = ChildRef {
                addr,
                rollup: inner.rollup(),
            };
            height += 1;
        }
    }

    /// Append a node, retrying once on I/O failure. The store moves past a
    /// failed volume, so the retry lands elsewhere.
    fn write_node(&self, payload: &[u8]) -> Result<BlockAddr> {
        match self.store.append(payload) {
            Err(e) if e.is_retryable() => {
                warn!(param_id = self.param_id, error = %e, "Block write failed, retrying");
                self.store.append(payload)
            }
            other => other,
        }
    }

    fn fold(&self, child: ChildRef, height: usize, range: TimeRange, acc: &mut Rollup) -> Result<()> {
        let rollup = &child.rollup;
        if !range.overlaps(rollup.min_ts, rollup.max_ts) {
            return Ok(());
        }
        if range.covers(rollup.min_ts, rollup.max_ts) {
            acc.merge(rollup);
            return Ok(());
        }

        if height == 0 {
            let leaf = read_leaf(&self.store, self.param_id, child.addr)?;
            for (ts, value) in leaf.samples()? {
                if range.contains(ts) {
                    acc.add(ts, value.as_f64());
                }
            }
        } else {
            let inner = read_inner(&self.store, self.param_id, child.addr)?;
            for grandchild in inner.children {
                self.fold(grandchild, height - 1, range, acc)?;
            }
        }
        Ok(())
    }
}

/// Tree statistics
#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub param_id: ParamId,
    pub root: Option<String>,
    /// Open references per level, bottom up
    pub levels: Vec<usize>,
    pub tail_len: usize,
    pub samples: u64,
    pub last_timestamp: Option<Timestamp>,
    pub last_seq: SequenceNumber,
    pub dirty: bool,
}

fn clamp(mut config: TreeConfig) -> TreeConfig {
    config.fanout = config.fanout.clamp(2, INNER_CAPACITY);
    config.tail_capacity = config.tail_capacity.clamp(1, MAX_TAIL_CAPACITY);
    config
}

pub(crate) fn read_leaf(store: &BlockStore, param_id: ParamId, addr: BlockAddr) -> Result<Leaf> {
    let leaf = Leaf::decode(addr, &store.read(addr)?)?;
    if leaf.param_id != param_id {
        return Err(RidgeError::corruption(addr, "leaf belongs to another series"));
    }
    Ok(leaf)
}

pub(crate) fn read_inner(store: &BlockStore, param_id: ParamId, addr: BlockAddr) -> Result<Inner> {
    let inner = Inner::decode(addr, &store.read(addr)?)?;
    if inner.param_id != param_id {
        return Err(RidgeError::corruption(addr, "node belongs to another series"));
    }
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{BlockStoreConfig, StoreMode};
    use crate::{AggregateFunction, Sample};
    use rand::seq::SliceRandom;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn store(dir: &TempDir) -> Arc<BlockStore> {
        let config = BlockStoreConfig {
            volumes: 2,
            volume_size: 1024 * 4096,
            mode: StoreMode::Expandable,
            allocate: false,
        };
        Arc::new(BlockStore::create(dir.path(), &config, Uuid::new_v4()).unwrap())
    }

    fn small() -> TreeConfig {
        TreeConfig {
            tail_capacity: 10,
            fanout: 4,
        }
    }

    fn collect(cursor: TreeCursor) -> Vec<Sample> {
        cursor.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_full_range_returns_everything_in_order() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());

        for i in 0..537u64 {
            assert_eq!(tree.append(i * 10, Value::Float(i as f64)).unwrap(), WriteStatus::Ok);
        }
        let stats = tree.stats();
        assert_eq!(stats.samples, 537);
        assert!(stats.levels.len() >= 3);

        let samples = collect(tree.iterate(TimeRange::all()));
        assert_eq!(samples.len(), 537);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.timestamp, i as u64 * 10);
            assert_eq!(sample.value, Value::Float(i as f64));
        }
    }

    #[test]
    fn test_range_query_prunes_to_bounds() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());
        for i in 0..300u64 {
            tree.append(i, Value::Integer(i as i64)).unwrap();
        }

        let samples = collect(tree.iterate(TimeRange::new(95, 204)));
        let ts: Vec<u64> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, (95..=204).collect::<Vec<_>>());
        assert!(collect(tree.iterate(TimeRange::new(1000, 2000))).is_empty());
    }

    #[test]
    fn test_aggregate_matches_enumeration() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());
        for i in 0..500u64 {
            tree.append(i, Value::Float((i % 17) as f64)).unwrap();
        }

        for range in [TimeRange::all(), TimeRange::new(13, 377), TimeRange::new(498, 498)] {
            let rollup = tree.aggregate(range).unwrap();
            let expected: Vec<f64> = (0..500u64)
                .filter(|ts| range.contains(*ts))
                .map(|ts| (ts % 17) as f64)
                .collect();
            assert_eq!(rollup.count, expected.len() as u64);
            assert_eq!(rollup.get(AggregateFunction::Sum), Some(expected.iter().sum()));
            assert_eq!(
                rollup.get(AggregateFunction::Max),
                expected.iter().cloned().reduce(f64::max)
            );
        }
        assert_eq!(tree.aggregate(TimeRange::new(600, 700)).unwrap().count, 0);
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let tree = NBTree::new(7, store.clone(), small());
        for i in 0..123u64 {
            tree.append(i, Value::Integer(i as i64)).unwrap();
        }
        let root = tree.commit().unwrap().root;
        assert!(!tree.is_dirty());
        let again = tree.commit().unwrap();
        assert_eq!(again.root, root);
        assert!(!again.written);

        let reopened = NBTree::open(7, store.clone(), small(), root).unwrap();
        assert_eq!(reopened.last_timestamp(), Some(122));
        let samples = collect(reopened.iterate(TimeRange::all()));
        assert_eq!(samples.len(), 123);

        // appends continue after reopening, late writes are still detected
        assert_eq!(reopened.append(50, Value::Integer(0)).unwrap(), WriteStatus::LateWrite);
        assert_eq!(reopened.append(200, Value::Integer(0)).unwrap(), WriteStatus::Ok);
        assert_eq!(reopened.stats().samples, 125);

        // a root of another series is refused
        assert!(matches!(
            NBTree::open(8, store, small(), root),
            Err(e) if e.is_corruption()
        ));
    }

    #[test]
    fn test_late_writes_are_kept() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());

        let mut timestamps: Vec<u64> = (0..200).collect();
        timestamps.shuffle(&mut rand::thread_rng());
        let mut late = 0;
        for ts in &timestamps {
            if tree.append(*ts, Value::Float(1.0)).unwrap() == WriteStatus::LateWrite {
                late += 1;
            }
        }
        assert!(late > 0);
        tree.append(150, Value::Float(2.0)).unwrap();

        let mut seen: Vec<u64> = collect(tree.iterate(TimeRange::all()))
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(seen.len(), 201);
        seen.sort();
        let mut expected: Vec<u64> = (0..200).collect();
        expected.push(150);
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_cursor_restart() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());
        for i in 0..100u64 {
            // every timestamp twice
            tree.append(i / 2, Value::Integer(i as i64)).unwrap();
        }

        let mut cursor = tree.iterate(TimeRange::all());
        let first: Vec<Sample> = cursor.by_ref().take(31).map(|s| s.unwrap()).collect();
        let pos = cursor.position().unwrap();
        assert_eq!(pos.timestamp, 15);
        assert_eq!(pos.seen, 1);

        let rest = collect(tree.iterate_from(TimeRange::all(), pos));
        assert_eq!(first.len() + rest.len(), 100);
        assert_eq!(rest[0].timestamp, 15);
        assert_eq!(rest[0].value, Value::Integer(31));
    }

    #[test]
    fn test_corrupted_block_fails_only_the_query() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let tree = NBTree::new(1, store.clone(), small());
        for i in 0..40u64 {
            tree.append(i, Value::Float(0.5)).unwrap();
        }
        let root = tree.commit().unwrap().root;

        // clobber the first leaf with a node of another series
        let other = Inner {
            param_id: 99,
            level: 1,
            children: vec![],
        };
        store.write(crate::blockstore::BlockAddr::new(0, 0), &other.encode()).unwrap();

        let results: Vec<Result<Sample>> = tree.iterate(TimeRange::all()).collect();
        assert!(results.last().unwrap().as_ref().unwrap_err().is_corruption());
        assert!(tree.aggregate(TimeRange::new(1, 5)).is_err());

        // the tree itself keeps working
        assert_eq!(tree.append(100, Value::Float(1.0)).unwrap(), WriteStatus::Ok);
        assert_eq!(tree.aggregate(TimeRange::new(100, 100)).unwrap().count, 1);
        assert!(NBTree::open(1, store, small(), root).is_ok());
    }

    #[test]
    fn test_commit_writes_only_what_changed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let used = || store.stats().used_blocks();

        // tail below the leaf size: every commit is a single root block
        let tree = NBTree::new(1, store.clone(), TreeConfig { tail_capacity: 1000, fanout: 4 });
        let before = used();
        let mut root = None;
        for i in 0..200u64 {
            tree.append(i * 10, Value::Float(i as f64)).unwrap();
            if i % 10 == 9 {
                root = Some(tree.commit().unwrap().root);
            }
        }
        assert_eq!(used() - before, 20);

        let reopened = NBTree::open(1, store.clone(), small(), root.unwrap()).unwrap();
        assert_eq!(reopened.stats().tail_len, 200);
        assert_eq!(collect(reopened.iterate(TimeRange::all())).len(), 200);

        // a partial inner node is only rewritten when its level grew
        let tree = NBTree::new(2, store.clone(), small());
        for i in 0..25u64 {
            tree.append(i, Value::Integer(1)).unwrap();
        }
        let before = used();
        tree.commit().unwrap();
        assert_eq!(used() - before, 2);

        for i in 25..28u64 {
            tree.append(i, Value::Integer(1)).unwrap();
        }
        let before = used();
        let root = tree.commit().unwrap().root;
        assert_eq!(used() - before, 1);

        let reopened = NBTree::open(2, store, small(), root).unwrap();
        let ts: Vec<u64> = collect(reopened.iterate(TimeRange::all()))
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(ts, (0..28).collect::<Vec<_>>());
    }

    #[test]
    fn test_large_tail_overflows_into_leaves() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let config = TreeConfig {
            tail_capacity: 2000,
            fanout: 4,
        };
        let tree = NBTree::new(3, store.clone(), config);

        // values that barely compress
        let samples: Vec<(u64, Value)> = (0..1500u64)
            .map(|i| (i * 1_000 + (i * 7919) % 613, Value::Float((i as f64).sqrt() * 1.37e5)))
            .collect();
        for (ts, value) in &samples {
            tree.append(*ts, *value).unwrap();
        }
        let root = tree.commit().unwrap().root;
        let decoded = Root::decode(root, &store.read(root).unwrap()).unwrap();
        assert!(matches!(decoded.tail, RootTail::Leaves(ref addrs) if addrs.len() > 1));

        let reopened = NBTree::open(3, store, config, root).unwrap();
        let restored: Vec<(u64, Value)> = collect(reopened.iterate(TimeRange::all()))
            .iter()
            .map(|s| (s.timestamp, s.value))
            .collect();
        assert_eq!(restored, samples);
    }

    #[test]
    fn test_logged_appends_track_sequence() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());
        for seq in 1..=30u64 {
            tree.append_logged(seq, Value::Integer(0), || Ok(seq)).unwrap();
        }
        let commit = tree.commit().unwrap();
        assert_eq!(commit.seq, 30);
        assert_eq!(tree.stats().last_seq, 30);

        // a failing log leaves the tree unchanged
        let err = tree.append_logged(31, Value::Integer(0), || {
            Err(RidgeError::WalSaturated { shard: 0 })
        });
        assert!(err.is_err());
        assert_eq!(tree.stats().samples, 30);
        assert!(!tree.is_dirty());
    }

    #[test]
    fn test_readers_see_whole_flushes() {
        let dir = TempDir::new().unwrap();
        let tree = NBTree::new(1, store(&dir), small());

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..3000u64 {
                    tree.append(i, Value::Integer(i as i64)).unwrap();
                }
            });
            s.spawn(|| {
                let mut seen = 0;
                while seen < 3000 {
                    let ts: Vec<u64> = collect(tree.iterate(TimeRange::all()))
                        .iter()
                        .map(|s| s.timestamp)
                        .collect();
                    // always a complete prefix, never a torn seal
                    assert!(ts.len() >= seen);
                    assert!(ts.iter().enumerate().all(|(i, t)| *t == i as u64));
                    seen = ts.len();
                }
            });
        });
    }

    #[test]
    fn test_commit_while_appending() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let tree = NBTree::new(1, store.clone(), small());

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..2000u64 {
                    tree.append(i, Value::Float(1.0)).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..50 {
                    let commit = tree.commit().unwrap();
                    let reopened = NBTree::open(1, store.clone(), small(), commit.root).unwrap();
                    let ts: Vec<u64> = collect(reopened.iterate(TimeRange::all()))
                        .iter()
                        .map(|s| s.timestamp)
                        .collect();
                    assert!(ts.iter().enumerate().all(|(i, t)| *t == i as u64));
                }
            });
        });

        let root = tree.commit().unwrap().root;
        let reopened = NBTree::open(1, store, small(), root).unwrap();
        assert_eq!(reopened.stats().samples, 2000);
    }
}
