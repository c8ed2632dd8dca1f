//! Response status patterns such as `2xx` or `40x`.

use std::{fmt, str::FromStr};

use http::StatusCode;
use serde::Deserialize;

/// A three character status code pattern. Each position is a digit or the `x` wildcard.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct StatusPattern([u8; 3]);

/// Error returned when a status pattern does not match `[0-9x]{3}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status code pattern '{0}', expected three characters of digits or 'x' (e.g. \"2xx\")")]
pub struct InvalidStatusPattern(pub String);

impl StatusPattern {
    /// Matches every 2xx response.
    pub const SUCCESS: Self = Self(*b"2xx");
    /// Matches every 3xx response.
    pub const REDIRECTION: Self = Self(*b"3xx");
    /// Matches every response.
    pub const ANY: Self = Self(*b"xxx");

    /// Returns true if every position of the pattern is `x` or equals the status digit at that position.
    pub fn matches(&self, status: StatusCode) -> bool {
        self.0
            .iter()
            .zip(status.as_str().bytes())
            .all(|(pattern, digit)| *pattern == b'x' || *pattern == digit)
    }

    /// The pattern as written, e.g. `"4xx"`.
    pub fn as_str(&self) -> &str {
        // Only ASCII digits and 'x' are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("xxx")
    }
}

impl FromStr for StatusPattern {
    type Err = InvalidStatusPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 3] = s
            .as_bytes()
            .try_into()
            .map_err(|_| InvalidStatusPattern(s.to_string()))?;

        let mut pattern = [0u8; 3];

        for (slot, byte) in pattern.iter_mut().zip(bytes) {
            *slot = match byte.to_ascii_lowercase() {
                b @ (b'0'..=b'9' | b'x') => b,
                _ => return Err(InvalidStatusPattern(s.to_string())),
            };
        }

        Ok(Self(pattern))
    }
}

impl TryFrom<String> for StatusPattern {
    type Error = InvalidStatusPattern;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Debug for StatusPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for StatusPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn default_codes() -> Vec<StatusPattern> {
    vec![StatusPattern::SUCCESS, StatusPattern::REDIRECTION]
}
