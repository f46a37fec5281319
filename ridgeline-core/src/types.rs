//! Core types for Ridgeline

use crate::{Result, RidgeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable numeric identifier of a series
pub type ParamId = u64;

/// Timestamp in caller-defined ticks (usually nanoseconds since Unix epoch)
pub type Timestamp = u64;

/// Log-wide WAL sequence number
pub type SequenceNumber = u64;

/// Series identity: a metric plus an ordered tag set
///
/// Text form is `metric tag=value tag=value`. The metric is optional, tags are
/// kept sorted so that `cpu b=1 a=2` and `cpu a=2 b=1` name the same series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesName {
    /// Metric name (e.g., "cpu.user"), may be empty
    pub metric: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl SeriesName {
    /// Create a new series name without tags
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the series name
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Parse the text form, validating every tag
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace().peekable();
        let mut name = SeriesName::new("");

        match tokens.peek() {
            None => return Err(RidgeError::InvalidSeriesName("empty series name".into())),
            Some(first) if !first.contains('=') => {
                name.metric = first.to_string();
                tokens.next();
            }
            Some(_) => {}
        }

        for token in tokens {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                RidgeError::InvalidSeriesName(format!("tag without value: {}", token))
            })?;
            if key.is_empty() || value.is_empty() {
                return Err(RidgeError::InvalidSeriesName(format!("empty tag: {}", token)));
            }
            if name.tags.insert(key.to_string(), value.to_string()).is_some() {
                return Err(RidgeError::InvalidSeriesName(format!("duplicate tag: {}", key)));
            }
        }

        Ok(name)
    }

    /// Parse raw bytes as handed over by protocol front ends
    pub fn parse_bytes(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| RidgeError::InvalidSeriesName(e.to_string()))?;
        Self::parse(text)
    }

    /// Create a canonical string representation for hashing
    pub fn canonical(&self) -> String {
        let mut s = self.metric.clone();
        for (k, v) in &self.tags {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }
}

impl fmt::Display for SeriesName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Scalar sample value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
}

impl Value {
    /// Get as f64
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(v) => *v,
            Value::Integer(v) => *v as f64,
        }
    }

    /// Raw 64 bits plus the type tag, the form stored in leaves and the WAL
    pub fn to_raw(&self) -> (bool, u64) {
        match self {
            Value::Float(v) => (false, v.to_bits()),
            Value::Integer(v) => (true, *v as u64),
        }
    }

    /// Inverse of [`Value::to_raw`]
    pub fn from_raw(is_integer: bool, bits: u64) -> Self {
        if is_integer {
            Value::Integer(bits as i64)
        } else {
            Value::Float(f64::from_bits(bits))
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
        }
    }
}

/// A single sample of one series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub param_id: ParamId,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    /// Create a new sample
    pub fn new(param_id: ParamId, timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            param_id,
            timestamp,
            value: value.into(),
        }
    }
}

/// Outcome of an accepted write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Sample appended in order
    Ok,
    /// Sample accepted but its timestamp precedes earlier data of the series
    LateWrite,
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if `[min, max]` intersects the range
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.start <= max && self.end >= min
    }

    /// Check if `[min, max]` lies entirely inside the range
    pub fn covers(&self, min: Timestamp, max: Timestamp) -> bool {
        self.start <= min && self.end >= max
    }
}

/// Aggregation functions answered from subtree rollups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl AggregateFunction {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "mean" | "avg" | "average" => Some(AggregateFunction::Mean),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_name_canonical() {
        let name = SeriesName::parse("cpu  region=eu host=a").unwrap();
        assert_eq!(name.metric, "cpu");
        assert_eq!(name.canonical(), "cpu host=a region=eu");

        let same = SeriesName::new("cpu").with_tag("region", "eu").with_tag("host", "a");
        assert_eq!(name, same);
    }

    #[test]
    fn test_series_name_without_metric() {
        let name = SeriesName::parse("metric=cpu host=a").unwrap();
        assert!(name.metric.is_empty());
        assert_eq!(name.canonical(), "host=a metric=cpu");
    }

    #[test]
    fn test_series_name_errors() {
        assert!(SeriesName::parse("   ").is_err());
        assert!(SeriesName::parse("cpu host").is_err());
        assert!(SeriesName::parse("cpu host=a host=b").is_err());
        assert!(SeriesName::parse("cpu =a").is_err());
        assert!(SeriesName::parse_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_value_raw_form() {
        let f = Value::Float(-2.5);
        let (tag, bits) = f.to_raw();
        assert_eq!(Value::from_raw(tag, bits), f);

        let i = Value::Integer(-42);
        let (tag, bits) = i.to_raw();
        assert!(tag);
        assert_eq!(Value::from_raw(tag, bits), i);
        assert_eq!(i.as_f64(), -42.0);
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(100, 200);
        assert!(range.contains(100));
        assert!(range.contains(200));
        assert!(!range.contains(201));
        assert!(range.overlaps(150, 250));
        assert!(!range.overlaps(201, 300));
        assert!(range.covers(120, 180));
        assert!(!range.covers(50, 180));
    }
}
