//! Query processing
//!
//! A query is a JSON [`QueryDescriptor`]: the series to read, a time range,
//! the cross-series order and a list of pipeline stages. The
//! [`QueryProcessor`] turns it into a [`ReadOperation`], a pull-based cursor
//! that formats results into caller-provided buffers so the consumer sets
//! the pace.

mod aggregates;
mod format;
mod operation;
mod pipeline;
mod source;

pub use aggregates::*;
pub use format::{formatter, CsvFormatter, JsonLinesFormatter, OutputFormat, OutputFormatter};
pub use operation::{ApiEndpoint, ReadOperation};
pub use pipeline::{build, Node, Sink, SinkState, StageSpec};
pub use source::{combine, MergeCursor, Order, SampleSource};

use crate::registry::TreeRegistry;
use crate::{AggregateFunction, Result, RidgeError, Sample, SeriesName, TimeRange};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default bytes a read operation formats ahead
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Declarative query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Series names. For the series endpoint, name prefixes.
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default = "TimeRange::all")]
    pub range: TimeRange,
    #[serde(default)]
    pub order: Order,
    #[serde(default)]
    pub pipeline: Vec<StageSpec>,
    /// Function of the aggregate endpoint
    #[serde(default)]
    pub function: Option<AggregateFunction>,
    #[serde(default)]
    pub output: OutputFormat,
}

impl QueryDescriptor {
    pub fn new(select: Vec<String>, range: TimeRange) -> Self {
        Self {
            select,
            range,
            order: Order::default(),
            pipeline: Vec::new(),
            function: None,
            output: OutputFormat::default(),
        }
    }

    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.pipeline.push(stage);
        self
    }

    pub fn parse(text: &[u8]) -> Result<Self> {
        serde_json::from_slice(text).map_err(|e| RidgeError::Query(format!("bad query: {}", e)))
    }
}

/// Creates read operations against a registry
#[derive(Clone)]
pub struct QueryProcessor {
    registry: Arc<TreeRegistry>,
    read_buffer: usize,
}

impl QueryProcessor {
    pub fn new(registry: Arc<TreeRegistry>, read_buffer: usize) -> Self {
        Self {
            registry,
            read_buffer: read_buffer.max(1),
        }
    }

    /// New operation for `endpoint`; feed it the query text with `append`
    pub fn create(&self, endpoint: ApiEndpoint) -> ReadOperation {
        ReadOperation::new(self.registry.clone(), endpoint, self.read_buffer)
    }

    /// Run a query to completion and collect its output samples
    pub fn execute(&self, descriptor: &QueryDescriptor) -> Result<Vec<Sample>> {
        let mut source = open_source(&self.registry, descriptor)?;
        let sink = Sink::new();
        let mut head = build(&descriptor.pipeline, sink.clone());

        loop {
            match source.next() {
                Some(Ok(sample)) => {
                    if !head.put(sample) {
                        head.complete();
                        break;
                    }
                }
                Some(Err(e)) => {
                    head.set_error(e);
                    break;
                }
                None => {
                    head.complete();
                    break;
                }
            }
        }

        match sink.take_error() {
            Some(e) => Err(e),
            None => Ok(sink.drain()),
        }
    }
}

/// Cursors over every selected series
pub(crate) fn open_source(registry: &TreeRegistry, descriptor: &QueryDescriptor) -> Result<SampleSource> {
    let mut cursors = Vec::with_capacity(descriptor.select.len());
    for text in &descriptor.select {
        let name = SeriesName::parse(text)?;
        let param_id = registry
            .lookup(&name)
            .ok_or_else(|| RidgeError::SeriesNotFound(name.canonical()))?;
        cursors.push(registry.get_tree(param_id)?.iterate(descriptor.range));
    }
    Ok(combine(cursors, descriptor.order))
}

/// One rollup-derived sample per selected series that has data in range
pub(crate) fn aggregate_source(
    registry: &TreeRegistry,
    descriptor: &QueryDescriptor,
) -> Result<SampleSource> {
    let func = descriptor
        .function
        .ok_or_else(|| RidgeError::Query("aggregate query needs a function".into()))?;

    let mut samples = Vec::with_capacity(descriptor.select.len());
    for text in &descriptor.select {
        let name = SeriesName::parse(text)?;
        let param_id = registry
            .lookup(&name)
            .ok_or_else(|| RidgeError::SeriesNotFound(name.canonical()))?;
        let rollup = registry.get_tree(param_id)?.aggregate(descriptor.range)?;
        if rollup.is_empty() {
            continue;
        }
        if let Some(value) = rollup.get(func) {
            let value = match func {
                AggregateFunction::Count => crate::Value::Integer(rollup.count as i64),
                _ => crate::Value::Float(value),
            };
            samples.push(Ok(Sample::new(param_id, rollup.max_ts, value)));
        }
    }
    Ok(Box::new(samples.into_iter()))
}
