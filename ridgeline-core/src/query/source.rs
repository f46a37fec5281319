//! Sample sources feeding a pipeline

use crate::nbtree::TreeCursor;
use crate::{Result, Sample, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Order of samples across series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// One series after another
    #[default]
    Series,
    /// Merged by timestamp
    Time,
}

/// Lazy sequence of samples
pub type SampleSource = Box<dyn Iterator<Item = Result<Sample>> + Send>;

/// Combine per-series cursors in the requested order
pub fn combine(cursors: Vec<TreeCursor>, order: Order) -> SampleSource {
    match order {
        Order::Series => Box::new(cursors.into_iter().flatten()),
        Order::Time => Box::new(MergeCursor::new(cursors)),
    }
}

/// K-way merge by timestamp. Ties go to the cursor listed first.
pub struct MergeCursor {
    cursors: Vec<TreeCursor>,
    heads: Vec<Option<Sample>>,
    heap: BinaryHeap<Reverse<(Timestamp, usize)>>,
    error: Option<crate::RidgeError>,
    primed: bool,
}

impl MergeCursor {
    pub fn new(cursors: Vec<TreeCursor>) -> Self {
        let n = cursors.len();
        Self {
            cursors,
            heads: vec![None; n],
            heap: BinaryHeap::with_capacity(n),
            error: None,
            primed: false,
        }
    }

    fn pull(&mut self, idx: usize) {
        match self.cursors[idx].next() {
            Some(Ok(sample)) => {
                self.heap.push(Reverse((sample.timestamp, idx)));
                self.heads[idx] = Some(sample);
            }
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeCursor {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for idx in 0..self.cursors.len() {
                self.pull(idx);
            }
        }
        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        let Reverse((_, idx)) = self.heap.pop()?;
        let sample = self.heads[idx].take()?;
        self.pull(idx);
        Some(Ok(sample))
    }
}
