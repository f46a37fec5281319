//! Text ingestion protocol shared by the HTTP, TCP and UDP front ends
//!
//! One sample per line: `<series name> <timestamp> <value>`. The series name
//! may itself contain spaces (`cpu host=a region=eu`), so the line is split
//! from the right. Timestamps are integer ticks or RFC 3339 dates; values
//! without a fraction or exponent are integers.

use chrono::DateTime;
use ridgeline_core::registry::Dispatcher;
use ridgeline_core::{RidgeError, Timestamp, Value, WriteStatus};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Malformed input line
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("line is not valid UTF-8")]
    Encoding,

    #[error("expected `<series> <timestamp> <value>`")]
    Fields,

    #[error("bad timestamp: {0}")]
    Timestamp(String),

    #[error("bad value: {0}")]
    Value(String),
}

/// A parsed line, borrowing the series name from the input
#[derive(Debug, PartialEq)]
pub struct ParsedLine<'a> {
    pub series: &'a [u8],
    pub timestamp: Timestamp,
    pub value: Value,
}

pub fn parse_line(line: &[u8]) -> Result<ParsedLine<'_>, ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::Encoding)?;
    let text = text.trim();

    let (rest, value) = text.rsplit_once(char::is_whitespace).ok_or(ProtocolError::Fields)?;
    let rest = rest.trim_end();
    let (series, timestamp) = rest.rsplit_once(char::is_whitespace).ok_or(ProtocolError::Fields)?;
    let series = series.trim_end();
    if series.is_empty() {
        return Err(ProtocolError::Fields);
    }

    Ok(ParsedLine {
        series: series.as_bytes(),
        timestamp: parse_timestamp(timestamp)?,
        value: parse_value(value)?,
    })
}

fn parse_timestamp(s: &str) -> Result<Timestamp, ProtocolError> {
    if let Ok(ticks) = s.parse::<u64>() {
        return Ok(ticks);
    }
    let date = DateTime::parse_from_rfc3339(s).map_err(|_| ProtocolError::Timestamp(s.into()))?;
    date.timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| ProtocolError::Timestamp(s.into()))
}

fn parse_value(s: &str) -> Result<Value, ProtocolError> {
    if !s.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
        if let Ok(v) = s.parse::<i64>() {
            return Ok(Value::Integer(v));
        }
    }
    s.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| ProtocolError::Value(s.into()))
}

/// Result of ingesting a block of lines
#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub written: u64,
    pub late_writes: u64,
    pub errors: Vec<String>,
    /// Set when the engine pushed back (out of space or WAL saturated)
    #[serde(skip)]
    pub backpressure: bool,
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse and write every line of `data`. A bad line only drops itself.
pub fn ingest(dispatcher: &mut Dispatcher, data: &[u8]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for (n, line) in data.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match ingest_line(dispatcher, line) {
            Ok(WriteStatus::Ok) => outcome.written += 1,
            Ok(WriteStatus::LateWrite) => {
                outcome.written += 1;
                outcome.late_writes += 1;
            }
            Err(e) => {
                debug!(line = n + 1, "Rejected line: {}", e);
                if let LineError::Engine(ref err) = e {
                    outcome.backpressure |= err.is_backpressure();
                }
                outcome.errors.push(format!("line {}: {}", n + 1, e));
            }
        }
    }
    outcome
}

/// Why one line was not written
#[derive(Error, Debug)]
pub enum LineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Engine(#[from] RidgeError),
}

pub fn ingest_line(dispatcher: &mut Dispatcher, line: &[u8]) -> Result<WriteStatus, LineError> {
    let parsed = parse_line(line)?;
    Ok(dispatcher.write(parsed.series, parsed.timestamp, parsed.value)?)
}
