//! Query processing stages
//!
//! A pipeline is a linked chain of nodes ending in a [`Sink`]. The reader
//! pushes samples into the head with `put`, calls `complete` once when the
//! source is exhausted, or `set_error` when the source fails. `put` returns
//! false once the chain wants no more input.

use super::aggregates::{accumulator, Accumulator};
use crate::{AggregateFunction, ParamId, RidgeError, Sample, Timestamp, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A pipeline stage
pub trait Node: Send {
    /// Accept a sample, false when no more input is wanted
    fn put(&mut self, sample: Sample) -> bool;

    /// Flush buffered state downstream. Called once, after the last `put`.
    fn complete(&mut self);

    /// Abort the chain
    fn set_error(&mut self, error: RidgeError);
}

/// Declarative description of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageSpec {
    /// Keep samples whose value lies within the given bounds
    Filter {
        #[serde(default)]
        gt: Option<f64>,
        #[serde(default)]
        ge: Option<f64>,
        #[serde(default)]
        lt: Option<f64>,
        #[serde(default)]
        le: Option<f64>,
    },
    /// Per-tick rate of change between successive samples of a bucket
    Rate {
        #[serde(default)]
        window: u64,
    },
    /// Total of each bucket
    Sum {
        #[serde(default)]
        window: u64,
    },
    /// Any aggregate function over each bucket
    Aggregate {
        func: AggregateFunction,
        #[serde(default)]
        window: u64,
    },
    /// Multiply values by a constant
    Scale { factor: f64 },
    /// Skip `offset` samples, then pass at most `limit`
    Limit {
        limit: u64,
        #[serde(default)]
        offset: u64,
    },
}

/// Wire stages in order in front of `sink`
pub fn build(stages: &[StageSpec], sink: Sink) -> Box<dyn Node> {
    let mut next: Box<dyn Node> = Box::new(sink);
    for stage in stages.iter().rev() {
        next = match *stage {
            StageSpec::Filter { gt, ge, lt, le } => Box::new(Filter {
                gt,
                ge,
                lt,
                le,
                next,
            }),
            StageSpec::Rate { window } => Box::new(Rate::new(window, next)),
            StageSpec::Sum { window } => {
                Box::new(BucketAggregate::new(AggregateFunction::Sum, window, next))
            }
            StageSpec::Aggregate { func, window } => {
                Box::new(BucketAggregate::new(func, window, next))
            }
            StageSpec::Scale { factor } => Box::new(Scale { factor, next }),
            StageSpec::Limit { limit, offset } => Box::new(Limit {
                limit,
                offset,
                next,
            }),
        };
    }
    next
}

/// Bucket of a timestamp, everything falls in bucket 0 when `window` is 0
fn bucket(timestamp: Timestamp, window: u64) -> u64 {
    if window == 0 {
        0
    } else {
        timestamp / window
    }
}

/// Pass-through filter on value bounds
pub struct Filter {
    gt: Option<f64>,
    ge: Option<f64>,
    lt: Option<f64>,
    le: Option<f64>,
    next: Box<dyn Node>,
}

impl Filter {
    fn accepts(&self, v: f64) -> bool {
        self.gt.map_or(true, |b| v > b)
            && self.ge.map_or(true, |b| v >= b)
            && self.lt.map_or(true, |b| v < b)
            && self.le.map_or(true, |b| v <= b)
    }
}

impl Node for Filter {
    fn put(&mut self, sample: Sample) -> bool {
        if self.accepts(sample.value.as_f64()) {
            self.next.put(sample)
        } else {
            true
        }
    }

    fn complete(&mut self) {
        self.next.complete();
    }

    fn set_error(&mut self, error: RidgeError) {
        self.next.set_error(error);
    }
}

/// Rate of change keyed by `(ParamId, bucket)`.
///
/// The first sample of a key only primes it. Samples that don't advance the
/// clock (duplicates, late writes) produce nothing.
pub struct Rate {
    window: u64,
    table: HashMap<(ParamId, u64), (Timestamp, f64)>,
    current: HashMap<ParamId, u64>,
    next: Box<dyn Node>,
}

impl Rate {
    pub fn new(window: u64, next: Box<dyn Node>) -> Self {
        Self {
            window,
            table: HashMap::new(),
            current: HashMap::new(),
            next,
        }
    }
}

impl Node for Rate {
    fn put(&mut self, sample: Sample) -> bool {
        let b = bucket(sample.timestamp, self.window);
        if let Some(old) = self.current.insert(sample.param_id, b) {
            if old != b {
                self.table.remove(&(sample.param_id, old));
            }
        }

        let value = sample.value.as_f64();
        match self.table.get_mut(&(sample.param_id, b)) {
            None => {
                self.table
                    .insert((sample.param_id, b), (sample.timestamp, value));
                true
            }
            Some((prev_ts, prev_value)) => {
                if sample.timestamp <= *prev_ts {
                    return true;
                }
                let rate = (value - *prev_value) / (sample.timestamp - *prev_ts) as f64;
                *prev_ts = sample.timestamp;
                *prev_value = value;
                self.next
                    .put(Sample::new(sample.param_id, sample.timestamp, Value::Float(rate)))
            }
        }
    }

    fn complete(&mut self) {
        self.table.clear();
        self.next.complete();
    }

    fn set_error(&mut self, error: RidgeError) {
        self.next.set_error(error);
    }
}

struct BucketState {
    acc: Box<dyn Accumulator>,
    last_ts: Timestamp,
}

/// Aggregate keyed by `(ParamId, bucket)`.
///
/// A bucket is emitted when its series moves on to another bucket, the rest
/// on `complete`. The output timestamp is the bucket start, or the last
/// timestamp seen when there is no window. Buckets without samples emit
/// nothing.
pub struct BucketAggregate {
    func: AggregateFunction,
    window: u64,
    table: HashMap<(ParamId, u64), BucketState>,
    current: HashMap<ParamId, u64>,
    stopped: bool,
    next: Box<dyn Node>,
}

impl BucketAggregate {
    pub fn new(func: AggregateFunction, window: u64, next: Box<dyn Node>) -> Self {
        Self {
            func,
            window,
            table: HashMap::new(),
            current: HashMap::new(),
            stopped: false,
            next,
        }
    }

    fn emit(&mut self, key: (ParamId, u64)) -> bool {
        let Some(state) = self.table.remove(&key) else {
            return true;
        };
        let Some(value) = state.acc.result() else {
            return true;
        };
        let timestamp = if self.window == 0 {
            state.last_ts
        } else {
            key.1 * self.window
        };
        self.next.put(Sample::new(key.0, timestamp, Value::Float(value)))
    }
}

impl Node for BucketAggregate {
    fn put(&mut self, sample: Sample) -> bool {
        let b = bucket(sample.timestamp, self.window);
        if let Some(old) = self.current.insert(sample.param_id, b) {
            if old != b && !self.emit((sample.param_id, old)) {
                self.stopped = true;
                return false;
            }
        }

        let func = self.func;
        let state = self
            .table
            .entry((sample.param_id, b))
            .or_insert_with(|| BucketState {
                acc: accumulator(func),
                last_ts: sample.timestamp,
            });
        state.acc.add(sample.value.as_f64());
        state.last_ts = state.last_ts.max(sample.timestamp);
        true
    }

    fn complete(&mut self) {
        if !self.stopped {
            let mut keys: Vec<(ParamId, u64)> = self.table.keys().copied().collect();
            keys.sort_by_key(|(id, b)| (*b, *id));
            for key in keys {
                if !self.emit(key) {
                    break;
                }
            }
        }
        self.table.clear();
        self.next.complete();
    }

    fn set_error(&mut self, error: RidgeError) {
        self.table.clear();
        self.next.set_error(error);
    }
}

/// Multiply every value by a constant
pub struct Scale {
    factor: f64,
    next: Box<dyn Node>,
}

impl Node for Scale {
    fn put(&mut self, sample: Sample) -> bool {
        let value = Value::Float(sample.value.as_f64() * self.factor);
        self.next
            .put(Sample::new(sample.param_id, sample.timestamp, value))
    }

    fn complete(&mut self) {
        self.next.complete();
    }

    fn set_error(&mut self, error: RidgeError) {
        self.next.set_error(error);
    }
}

/// Offset and limit
pub struct Limit {
    limit: u64,
    offset: u64,
    next: Box<dyn Node>,
}

impl Node for Limit {
    fn put(&mut self, sample: Sample) -> bool {
        if self.offset > 0 {
            self.offset -= 1;
            return true;
        }
        if self.limit == 0 {
            return false;
        }
        self.limit -= 1;
        self.next.put(sample) && self.limit > 0
    }

    fn complete(&mut self) {
        self.next.complete();
    }

    fn set_error(&mut self, error: RidgeError) {
        self.next.set_error(error);
    }
}

/// What reached the end of the chain
#[derive(Debug, Default)]
pub struct SinkState {
    pub samples: VecDeque<Sample>,
    pub completed: bool,
    pub error: Option<RidgeError>,
}

/// Terminal node buffering results for the reader
#[derive(Clone, Default)]
pub struct Sink {
    state: Arc<Mutex<SinkState>>,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything buffered so far
    pub fn drain(&self) -> Vec<Sample> {
        self.state.lock().samples.drain(..).collect()
    }

    /// Samples waiting to be drained
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn take_error(&self) -> Option<RidgeError> {
        self.state.lock().error.take()
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().error.is_some()
    }
}

impl Node for Sink {
    fn put(&mut self, sample: Sample) -> bool {
        let mut state = self.state.lock();
        if state.error.is_some() {
            return false;
        }
        state.samples.push_back(sample);
        true
    }

    fn complete(&mut self) {
        self.state.lock().completed = true;
    }

    fn set_error(&mut self, error: RidgeError) {
        let mut state = self.state.lock();
        state.error = Some(error);
        state.completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stages: &[StageSpec], input: &[Sample]) -> Vec<Sample> {
        let sink = Sink::new();
        let mut head = build(stages, sink.clone());
        for sample in input {
            if !head.put(*sample) {
                break;
            }
        }
        head.complete();
        assert!(sink.is_completed());
        sink.drain()
    }

    fn series() -> Vec<Sample> {
        vec![
            Sample::new(1, 100, 1.0),
            Sample::new(1, 200, 3.0),
            Sample::new(1, 300, 5.0),
        ]
    }

    #[test]
    fn test_rate_without_window() {
        let out = run(&[StageSpec::Rate { window: 0 }], &series());
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].timestamp, out[0].value), (200, Value::Float(0.02)));
        assert_eq!((out[1].timestamp, out[1].value), (300, Value::Float(0.02)));
    }

    #[test]
    fn test_rate_restarts_per_bucket_and_ignores_stalls() {
        let input = vec![
            Sample::new(1, 0, 0.0),
            Sample::new(1, 10, 10.0),
            Sample::new(1, 10, 50.0),
            Sample::new(2, 5, 0.0),
            Sample::new(2, 7, 4.0),
            // next bucket: primes only
            Sample::new(1, 100, 0.0),
            Sample::new(1, 150, 100.0),
        ];
        let out = run(&[StageSpec::Rate { window: 100 }], &input);
        let got: Vec<(ParamId, Timestamp, f64)> = out
            .iter()
            .map(|s| (s.param_id, s.timestamp, s.value.as_f64()))
            .collect();
        assert_eq!(got, vec![(1, 10, 1.0), (2, 7, 2.0), (1, 150, 2.0)]);
    }

    #[test]
    fn test_sum_single_bucket() {
        let out = run(&[StageSpec::Sum { window: 0 }], &series());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Value::Float(9.0));
        assert_eq!(out[0].timestamp, 300);
    }

    #[test]
    fn test_sum_windows_skip_empty_buckets() {
        let input = vec![
            Sample::new(1, 5, 1.0),
            Sample::new(1, 7, 2.0),
            // bucket [10, 20) is empty
            Sample::new(1, 21, 4.0),
            Sample::new(2, 3, 10.0),
        ];
        let out = run(&[StageSpec::Sum { window: 10 }], &input);
        let got: Vec<(ParamId, Timestamp, f64)> = out
            .iter()
            .map(|s| (s.param_id, s.timestamp, s.value.as_f64()))
            .collect();
        // series 1 bucket 0 is emitted as soon as series 1 moves on
        assert_eq!(got, vec![(1, 0, 3.0), (2, 0, 10.0), (1, 20, 4.0)]);

        assert!(run(&[StageSpec::Sum { window: 10 }], &[]).is_empty());
    }

    #[test]
    fn test_filter_scale_limit_chain() {
        let input: Vec<Sample> = (0..20u64).map(|i| Sample::new(1, i, i as f64)).collect();
        let stages = [
            StageSpec::Filter {
                gt: None,
                ge: Some(5.0),
                lt: Some(15.0),
                le: None,
            },
            StageSpec::Scale { factor: 2.0 },
            StageSpec::Limit { limit: 3, offset: 1 },
        ];
        let out = run(&stages, &input);
        let values: Vec<f64> = out.iter().map(|s| s.value.as_f64()).collect();
        assert_eq!(values, vec![12.0, 14.0, 16.0]);
    }

    #[test]
    fn test_error_terminates_chain() {
        let sink = Sink::new();
        let mut head = build(&[StageSpec::Sum { window: 0 }], sink.clone());
        assert!(head.put(Sample::new(1, 1, 1.0)));
        head.set_error(RidgeError::Query("boom".into()));
        assert!(sink.is_completed());
        assert!(sink.take_error().is_some());
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_stage_spec_json() {
        let stages: Vec<StageSpec> = serde_json::from_str(
            r#"[{"stage": "rate"}, {"stage": "aggregate", "func": "max", "window": 60}]"#,
        )
        .unwrap();
        assert_eq!(
            stages,
            vec![
                StageSpec::Rate { window: 0 },
                StageSpec::Aggregate {
                    func: AggregateFunction::Max,
                    window: 60
                }
            ]
        );
    }
}
