//! Output formatting of query results

use crate::{Sample, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Wire format of query output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `series,timestamp,value` lines
    #[default]
    Csv,
    /// One JSON object per line
    Json,
}

/// Turns samples into bytes
pub trait OutputFormatter: Send {
    fn format(&mut self, series: &str, sample: &Sample, out: &mut Vec<u8>);
}

/// Formatter for `format`
pub fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Csv => Box::new(CsvFormatter),
        OutputFormat::Json => Box::new(JsonLinesFormatter),
    }
}

pub struct CsvFormatter;

impl OutputFormatter for CsvFormatter {
    fn format(&mut self, series: &str, sample: &Sample, out: &mut Vec<u8>) {
        // Writing into a Vec can't fail
        let _ = writeln!(out, "{},{},{}", series, sample.timestamp, sample.value);
    }
}

#[derive(Serialize)]
struct Row<'a> {
    series: &'a str,
    timestamp: Timestamp,
    value: Value,
}

pub struct JsonLinesFormatter;

impl OutputFormatter for JsonLinesFormatter {
    fn format(&mut self, series: &str, sample: &Sample, out: &mut Vec<u8>) {
        let row = Row {
            series,
            timestamp: sample.timestamp,
            value: sample.value,
        };
        if serde_json::to_writer(&mut *out, &row).is_ok() {
            out.push(b'\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        let sample = Sample::new(3, 1500, Value::Integer(-2));
        let mut out = Vec::new();
        formatter(OutputFormat::Csv).format("cpu host=a", &sample, &mut out);
        formatter(OutputFormat::Json).format("cpu host=a", &sample, &mut out);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "cpu host=a,1500,-2\n{\"series\":\"cpu host=a\",\"timestamp\":1500,\"value\":-2}\n"
        );
    }
}
