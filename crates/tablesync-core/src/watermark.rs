//! Sync watermarks.
//!
//! A watermark marks the boundary between changes a client has already seen
//! and changes that are new since its last sync. Clients send it either as an
//! integer (milliseconds since the UNIX epoch) or as an RFC 3339 string; both
//! normalize to epoch milliseconds, which is how the store columns compare.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time with millisecond precision, comparable with stored
/// `server_created_at`, `last_modified` and `deleted_at` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "WatermarkRepr", into = "i64")]
pub struct Watermark(i64);

impl Watermark {
    /// The UNIX epoch. A client that has never synced pulls from here.
    pub const EPOCH: Self = Self(0);

    /// Create a watermark from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// The current wall clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(current_time_ms())
    }

    /// Milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Offset this watermark by a signed number of milliseconds.
    #[must_use]
    pub const fn offset(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Convert to a UTC datetime, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl From<Watermark> for i64 {
    fn from(value: Watermark) -> Self {
        value.0
    }
}

impl FromStr for Watermark {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(WatermarkError::Empty);
        }

        if let Ok(millis) = trimmed.parse::<i64>() {
            return Ok(Self(millis));
        }

        DateTime::parse_from_rfc3339(trimmed)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| WatermarkError::Invalid {
                input: trimmed.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Wire forms accepted for a watermark.
#[derive(Deserialize)]
#[serde(untagged)]
enum WatermarkRepr {
    Millis(i64),
    Text(String),
}

impl TryFrom<WatermarkRepr> for Watermark {
    type Error = WatermarkError;

    fn try_from(value: WatermarkRepr) -> Result<Self, Self::Error> {
        match value {
            WatermarkRepr::Millis(millis) => Ok(Self(millis)),
            WatermarkRepr::Text(text) => text.parse(),
        }
    }
}

/// Errors that can occur when parsing a watermark.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatermarkError {
    /// Empty input
    #[error("watermark is empty")]
    Empty,
    /// Neither an integer nor an RFC 3339 timestamp
    #[error("invalid watermark '{input}': {reason}")]
    Invalid {
        /// The rejected input
        input: String,
        /// Parser message
        reason: String,
    },
}

/// Get current wall clock time in milliseconds since UNIX epoch.
fn current_time_ms() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    i64::try_from(millis).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integer_and_rfc3339() {
        let from_int: Watermark = "1704067200000".parse().unwrap();
        let from_text: Watermark = "2024-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(from_int, from_text);
        assert_eq!(from_int.as_millis(), 1_704_067_200_000);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!("".parse::<Watermark>(), Err(WatermarkError::Empty));
        assert!(matches!(
            "yesterday".parse::<Watermark>(),
            Err(WatermarkError::Invalid { .. })
        ));
    }

    #[test]
    fn deserializes_both_wire_forms() {
        let a: Watermark = serde_json::from_str("1704067200000").unwrap();
        let b: Watermark = serde_json::from_str("\"2024-01-01T00:00:00.000Z\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "1704067200000");
    }

    #[test]
    fn ordering_follows_time() {
        let t = Watermark::from_millis(1_000);
        assert!(t.offset(-1) < t);
        assert!(t < t.offset(1));
        assert!(Watermark::EPOCH < Watermark::now());
    }

    #[test]
    fn display_is_rfc3339() {
        let t = Watermark::from_millis(1_704_067_200_123);
        assert_eq!(t.to_string(), "2024-01-01T00:00:00.123Z");
    }
}
