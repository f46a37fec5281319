//! Memory size strings such as `"256MB"` or `"4GB"`

use crate::{Result, RidgeError};
use serde::{Deserialize, Deserializer};

/// Parse a size with an optional `KB`/`MB`/`GB`/`TB` suffix (powers of 1024)
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| RidgeError::Config(format!("invalid size: {:?}", text)))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        other => return Err(RidgeError::Config(format!("unknown size unit: {:?}", other))),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| RidgeError::Config(format!("size overflows: {:?}", text)))
}

/// Serde hook accepting either a plain byte count or a size string
pub(crate) fn deserialize<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(n) => Ok(n),
        Raw::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("256MB").unwrap(), 256 << 20);
        assert_eq!(parse_size("4GB").unwrap(), 4 << 30);
        assert_eq!(parse_size(" 16 kb ").unwrap(), 16 << 10);
        assert!(parse_size("GB").is_err());
        assert!(parse_size("12XB").is_err());
    }
}
