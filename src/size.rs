//! Human readable byte sizes.

use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::error::SizeParseError;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Parses a size such as `"10MB"`, `"1.5 GB"` or `"2048"` into a number of bytes.
///
/// The accepted form is a decimal number, optionally followed (with optional whitespace in
/// between) by one of the binary units `KB`, `MB` or `GB` in any letter case. A bare number is
/// a byte count. Fractional results are rounded down.
///
/// # Examples
/// ```
/// use actix_multipart_spool::parse_size;
///
/// assert_eq!(parse_size("4 MB").unwrap(), 4 * 1024 * 1024);
/// assert_eq!(parse_size("2kb").unwrap(), 2048);
/// assert!(parse_size("ten megabytes").is_err());
/// ```
pub fn parse_size(size: &str) -> Result<u64, SizeParseError> {
    let invalid = || SizeParseError::new(size);

    let split = size
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size.len());
    let (number, unit) = size.split_at(split);

    let multiplier = match unit.trim_start().to_ascii_uppercase().as_str() {
        "" => 1,
        "KB" => KB,
        "MB" => MB,
        "GB" => GB,
        _ => return Err(invalid()),
    };

    match number.split_once('.') {
        None => {
            if number.is_empty() {
                return Err(invalid());
            }

            number
                .parse::<u64>()
                .ok()
                .and_then(|n| n.checked_mul(multiplier))
                .ok_or_else(invalid)
        }

        Some((int, frac)) => {
            let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

            if !digits(int) || !digits(frac) {
                return Err(invalid());
            }

            let value = number.parse::<f64>().map_err(|_| invalid())? * multiplier as f64;

            if !value.is_finite() || value >= u64::MAX as f64 {
                return Err(invalid());
            }

            Ok(value.floor() as u64)
        }
    }
}

/// A size given either as a byte count or as a size string.
///
/// Used by [`MultipartSettings`](crate::MultipartSettings) so that configuration files can say
/// either `maxBodyLimit = 1048576` or `maxBodyLimit = "1 MB"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ByteSize {
    /// Exact number of bytes.
    Bytes(u64),

    /// A size string understood by [`parse_size`].
    Text(String),
}

impl ByteSize {
    /// Resolves this size to a number of bytes.
    pub fn as_bytes(&self) -> Result<u64, SizeParseError> {
        match self {
            ByteSize::Bytes(n) => Ok(*n),
            ByteSize::Text(s) => parse_size(s),
        }
    }
}

impl From<u64> for ByteSize {
    fn from(n: u64) -> Self {
        ByteSize::Bytes(n)
    }
}

impl From<&str> for ByteSize {
    fn from(s: &str) -> Self {
        ByteSize::Text(s.to_owned())
    }
}

impl From<String> for ByteSize {
    fn from(s: String) -> Self {
        ByteSize::Text(s)
    }
}

impl FromStr for ByteSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(ByteSize::Bytes)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteSize::Bytes(n) => write!(f, "{n}"),
            ByteSize::Text(s) => f.write_str(s),
        }
    }
}
