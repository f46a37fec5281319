//! Lazy, restartable iteration over a tree snapshot

use super::{read_inner, read_leaf, ChildRef};
use crate::blockstore::BlockStore;
use crate::{ParamId, Result, Sample, TimeRange, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a cursor stopped: the last returned timestamp and how many samples
/// with that timestamp were returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub timestamp: Timestamp,
    pub seen: u64,
}

/// Iterator over the samples of one tree.
///
/// Nodes are read one at a time; subtrees whose rollup lies outside the range
/// are skipped. The first error ends the iteration.
pub struct TreeCursor {
    param_id: ParamId,
    store: Arc<BlockStore>,
    range: TimeRange,
    /// Pending subtrees, next one on top
    stack: Vec<(ChildRef, usize)>,
    buffer: std::vec::IntoIter<(Timestamp, Value)>,
    tail: Option<Vec<(Timestamp, Value)>>,
    skip: u64,
    skip_ts: Timestamp,
    last: Option<CursorPos>,
    done: bool,
}

impl TreeCursor {
    pub(super) fn new(
        param_id: ParamId,
        store: Arc<BlockStore>,
        range: TimeRange,
        mut nodes: Vec<(ChildRef, usize)>,
        tail: Vec<(Timestamp, Value)>,
        resume: Option<CursorPos>,
    ) -> Self {
        nodes.reverse();
        Self {
            param_id,
            store,
            range,
            stack: nodes,
            buffer: Vec::new().into_iter(),
            tail: Some(tail),
            skip: resume.map_or(0, |p| p.seen),
            skip_ts: resume.map_or(0, |p| p.timestamp),
            last: resume,
            done: false,
        }
    }

    pub fn param_id(&self) -> ParamId {
        self.param_id
    }

    /// Position to resume from with `NBTree::iterate_from`
    pub fn position(&self) -> Option<CursorPos> {
        self.last
    }

    fn expand(&mut self, child: ChildRef, height: usize) -> Result<()> {
        if height == 0 {
            let leaf = read_leaf(&self.store, self.param_id, child.addr)?;
            self.buffer = leaf.samples()?.into_iter();
        } else {
            let inner = read_inner(&self.store, self.param_id, child.addr)?;
            self.stack
                .extend(inner.children.into_iter().rev().map(|c| (c, height - 1)));
        }
        Ok(())
    }

    fn track(&mut self, timestamp: Timestamp) {
        self.last = Some(match self.last {
            Some(pos) if pos.timestamp == timestamp => CursorPos {
                timestamp,
                seen: pos.seen + 1,
            },
            _ => CursorPos { timestamp, seen: 1 },
        });
    }
}

impl Iterator for TreeCursor {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((ts, value)) = self.buffer.next() {
                if !self.range.contains(ts) {
                    continue;
                }
                if self.skip > 0 {
                    if ts == self.skip_ts {
                        self.skip -= 1;
                        continue;
                    }
                    self.skip = 0;
                }
                self.track(ts);
                return Some(Ok(Sample::new(self.param_id, ts, value)));
            }

            match self.stack.pop() {
                Some((child, height)) => {
                    let rollup = &child.rollup;
                    if !self.range.overlaps(rollup.min_ts, rollup.max_ts) {
                        continue;
                    }
                    if let Err(e) = self.expand(child, height) {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                None => match self.tail.take() {
                    Some(tail) => self.buffer = tail.into_iter(),
                    None => {
                        self.done = true;
                        return None;
                    }
                },
            }
        }
    }
}
