//! Pull-based read operations
//!
//! Lifecycle: `append` the query text, `start`, then `read_some` until it
//! reports done, then `close`. Output is produced lazily: each `read_some`
//! pulls just enough samples through the pipeline to fill the caller's
//! buffer, so a slow consumer slows the scan instead of growing a buffer.

use super::format::{formatter, OutputFormatter};
use super::pipeline::{build, Node, Sink};
use super::source::SampleSource;
use super::{aggregate_source, open_source, QueryDescriptor};
use crate::registry::TreeRegistry;
use crate::{ParamId, Result, RidgeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Samples pulled from the source per refill
const PULL_BATCH: usize = 256;

/// What a read operation answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiEndpoint {
    /// Samples of the selected series through the pipeline
    Query,
    /// One rollup-derived sample per series
    Aggregate,
    /// Names of live series, `select` entries act as prefixes
    Series,
}

struct Running {
    source: SampleSource,
    head: Box<dyn Node>,
    sink: Sink,
    formatter: Box<dyn OutputFormatter>,
    names: HashMap<ParamId, String>,
    exhausted: bool,
}

enum State {
    Created,
    Running(Box<Running>),
    Finished,
    Closed,
}

/// Resumable query cursor
pub struct ReadOperation {
    registry: Arc<TreeRegistry>,
    endpoint: ApiEndpoint,
    read_ahead: usize,
    query: Vec<u8>,
    state: State,
    pending: Vec<u8>,
    offset: usize,
    error: Option<RidgeError>,
}

impl ReadOperation {
    pub(crate) fn new(registry: Arc<TreeRegistry>, endpoint: ApiEndpoint, read_ahead: usize) -> Self {
        Self {
            registry,
            endpoint,
            read_ahead,
            query: Vec::new(),
            state: State::Created,
            pending: Vec::new(),
            offset: 0,
            error: None,
        }
    }

    pub fn endpoint(&self) -> ApiEndpoint {
        self.endpoint
    }

    /// Add a chunk of the query text
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        match self.state {
            State::Created => {
                self.query.extend_from_slice(chunk);
                Ok(())
            }
            _ => Err(RidgeError::Query("query text can't change after start".into())),
        }
    }

    /// Parse the query and open its sources.
    ///
    /// Errors in the query itself don't fail this call: they finish the
    /// operation and are reported by [`ReadOperation::get_error`].
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, State::Created) {
            return Err(RidgeError::Query("operation already started".into()));
        }
        match self.open() {
            Ok(state) => self.state = state,
            Err(e) => {
                debug!("Query rejected: {}", e);
                self.error = Some(e);
                self.state = State::Finished;
            }
        }
        Ok(())
    }

    fn open(&mut self) -> Result<State> {
        let descriptor = QueryDescriptor::parse(&self.query)?;

        let source = match self.endpoint {
            ApiEndpoint::Query => open_source(&self.registry, &descriptor)?,
            ApiEndpoint::Aggregate => aggregate_source(&self.registry, &descriptor)?,
            ApiEndpoint::Series => {
                let prefixes = &descriptor.select;
                for (name, _) in self.registry.list() {
                    if prefixes.is_empty() || prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                        self.pending.extend_from_slice(name.as_bytes());
                        self.pending.push(b'\n');
                    }
                }
                return Ok(State::Finished);
            }
        };

        let sink = Sink::new();
        Ok(State::Running(Box::new(Running {
            source,
            head: build(&descriptor.pipeline, sink.clone()),
            sink,
            formatter: formatter(descriptor.output),
            names: HashMap::new(),
            exhausted: false,
        })))
    }

    /// Copy the next chunk of output into `buf`. Returns the bytes written
    /// and whether the output is complete.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        match self.state {
            State::Created => return Err(RidgeError::Query("operation not started".into())),
            State::Closed => return Err(RidgeError::Query("operation is closed".into())),
            _ => {}
        }

        let want = buf.len().max(self.read_ahead);
        while self.pending.len() - self.offset < want && self.refill() {}

        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        if self.offset == self.pending.len() {
            self.pending.clear();
            self.offset = 0;
        }

        let done = matches!(self.state, State::Finished) && self.pending.is_empty();
        Ok((n, done))
    }

    /// Format more output. False once nothing more will come.
    fn refill(&mut self) -> bool {
        let State::Running(running) = &mut self.state else {
            return false;
        };

        if running.sink.is_empty() && !running.exhausted {
            for _ in 0..PULL_BATCH {
                match running.source.next() {
                    Some(Ok(sample)) => {
                        if !running.head.put(sample) {
                            running.head.complete();
                            running.exhausted = true;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        running.head.set_error(e);
                        running.exhausted = true;
                        break;
                    }
                    None => {
                        running.head.complete();
                        running.exhausted = true;
                        break;
                    }
                }
                if !running.sink.is_empty() {
                    break;
                }
            }
        }

        // Samples that reached the sink before a failure are still delivered
        for sample in running.sink.drain() {
            let registry = &self.registry;
            let name = running.names.entry(sample.param_id).or_insert_with(|| {
                registry
                    .series_name(sample.param_id)
                    .unwrap_or_else(|| sample.param_id.to_string())
            });
            running.formatter.format(name, &sample, &mut self.pending);
        }

        if let Some(e) = running.sink.take_error() {
            self.error = Some(e);
            self.state = State::Finished;
            return false;
        }

        if running.exhausted && running.sink.is_completed() && running.sink.is_empty() {
            self.state = State::Finished;
            return false;
        }
        true
    }

    /// Error that ended the operation, if any
    pub fn get_error(&self) -> Option<&RidgeError> {
        self.error.as_ref()
    }

    /// Release the sources. Further reads fail.
    pub fn close(&mut self) {
        self.state = State::Closed;
        self.pending = Vec::new();
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{BlockStore, BlockStoreConfig};
    use crate::nbtree::TreeConfig;
    use crate::query::{OutputFormat, QueryProcessor};
    use crate::{Sample, Value};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn processor(dir: &TempDir) -> QueryProcessor {
        let store = BlockStore::create(
            &dir.path().join("blocks"),
            &BlockStoreConfig {
                volumes: 1,
                volume_size: 256 * 4096,
                ..Default::default()
            },
            Uuid::new_v4(),
        )
        .unwrap();
        let registry = Arc::new(
            TreeRegistry::create(
                &dir.path().join("catalog"),
                Arc::new(store),
                None,
                TreeConfig {
                    tail_capacity: 8,
                    fanout: 4,
                },
            )
            .unwrap(),
        );
        let mut dispatcher = registry.create_dispatcher();
        for (ts, v) in [(100, 1.0), (200, 3.0), (300, 5.0)] {
            dispatcher.write(b"cpu host=a", ts, Value::Float(v)).unwrap();
        }
        for ts in 0..40u64 {
            dispatcher.write(b"mem host=a", ts, Value::Integer(ts as i64)).unwrap();
        }
        QueryProcessor::new(registry, 16)
    }

    fn read_all(op: &mut ReadOperation, chunk: usize) -> String {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let (n, done) = op.read_some(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if done {
                break;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_small_buffer_reads_everything() {
        let dir = TempDir::new().unwrap();
        let processor = processor(&dir);

        let mut op = processor.create(ApiEndpoint::Query);
        op.append(br#"{"select": ["mem host=a"], "#).unwrap();
        op.append(br#""range": {"start": 10, "end": 19}}"#).unwrap();
        op.start().unwrap();
        assert!(op.get_error().is_none());

        let text = read_all(&mut op, 7);
        let expected: String = (10..20).map(|ts| format!("mem host=a,{},{}\n", ts, ts)).collect();
        assert_eq!(text, expected);
        op.close();
        assert!(op.read_some(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_pipeline_output() {
        let dir = TempDir::new().unwrap();
        let processor = processor(&dir);

        let mut op = processor.create(ApiEndpoint::Query);
        op.append(br#"{"select": ["cpu host=a"], "pipeline": [{"stage": "sum"}]}"#)
            .unwrap();
        op.start().unwrap();
        assert_eq!(read_all(&mut op, 64), "cpu host=a,300,9\n");
    }

    #[test]
    fn test_aggregate_endpoint() {
        let dir = TempDir::new().unwrap();
        let processor = processor(&dir);

        let mut op = processor.create(ApiEndpoint::Aggregate);
        op.append(br#"{"select": ["cpu host=a", "mem host=a"], "function": "count"}"#)
            .unwrap();
        op.start().unwrap();
        assert_eq!(read_all(&mut op, 64), "cpu host=a,300,3\nmem host=a,39,40\n");

        let mut op = processor.create(ApiEndpoint::Aggregate);
        op.append(br#"{"select": ["cpu host=a"], "function": "max", "output": "json"}"#)
            .unwrap();
        op.start().unwrap();
        assert_eq!(
            read_all(&mut op, 64),
            "{\"series\":\"cpu host=a\",\"timestamp\":300,\"value\":5.0}\n"
        );
    }

    #[test]
    fn test_series_endpoint() {
        let dir = TempDir::new().unwrap();
        let processor = processor(&dir);

        let mut op = processor.create(ApiEndpoint::Series);
        op.append(br#"{"select": ["mem"]}"#).unwrap();
        op.start().unwrap();
        assert_eq!(read_all(&mut op, 3), "mem host=a\n");

        let mut op = processor.create(ApiEndpoint::Series);
        op.append(b"{}").unwrap();
        op.start().unwrap();
        assert_eq!(read_all(&mut op, 64), "cpu host=a\nmem host=a\n");
    }

    #[test]
    fn test_errors_are_reported() {
        let dir = TempDir::new().unwrap();
        let processor = processor(&dir);

        let mut op = processor.create(ApiEndpoint::Query);
        assert!(op.read_some(&mut [0u8; 8]).is_err());
        op.append(br#"{"select": ["disk host=z"]}"#).unwrap();
        op.start().unwrap();
        assert!(matches!(op.get_error(), Some(RidgeError::SeriesNotFound(_))));
        assert_eq!(op.read_some(&mut [0u8; 8]).unwrap(), (0, true));
        assert!(op.start().is_err());
        assert!(op.append(b"more").is_err());

        let mut op = processor.create(ApiEndpoint::Aggregate);
        op.append(br#"{"select": ["cpu host=a"]}"#).unwrap();
        op.start().unwrap();
        assert!(matches!(op.get_error(), Some(RidgeError::Query(_))));
    }

    /// Forwards samples and fails the chain after `left` of them
    struct FailAfter {
        sink: Sink,
        left: usize,
    }

    impl Node for FailAfter {
        fn put(&mut self, sample: Sample) -> bool {
            self.sink.put(sample);
            self.left -= 1;
            if self.left == 0 {
                self.sink.set_error(RidgeError::Query("stage failed".into()));
                return false;
            }
            true
        }

        fn complete(&mut self) {
            self.sink.complete();
        }

        fn set_error(&mut self, error: RidgeError) {
            self.sink.set_error(error);
        }
    }

    #[test]
    fn test_output_before_a_stage_error_is_delivered() {
        let dir = TempDir::new().unwrap();
        let processor = processor(&dir);
        let cpu = processor.registry.list().into_iter().find(|(n, _)| n == "cpu host=a").unwrap().1;

        let sink = Sink::new();
        let mut op = ReadOperation::new(processor.registry.clone(), ApiEndpoint::Query, 16);
        op.state = State::Running(Box::new(Running {
            source: Box::new(
                vec![Ok(Sample::new(cpu, 10, Value::Integer(5))), Ok(Sample::new(cpu, 20, Value::Integer(6)))]
                    .into_iter(),
            ),
            head: Box::new(FailAfter {
                sink: sink.clone(),
                left: 1,
            }),
            sink,
            formatter: formatter(OutputFormat::Csv),
            names: HashMap::new(),
            exhausted: false,
        }));

        assert_eq!(read_all(&mut op, 64), "cpu host=a,10,5\n");
        assert!(matches!(op.get_error(), Some(RidgeError::Query(_))));
    }
}
