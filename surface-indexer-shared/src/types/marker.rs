//! Modification markers and their persisted watermark form.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A modification marker: either a primary-key high-water mark or a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl Marker {
    /// Read a marker from a source row value.
    ///
    /// Integers become [`Marker::Integer`]; RFC 3339 strings (with or without an
    /// offset, as rendered for `timestamptz` and `timestamp` columns) become
    /// [`Marker::Timestamp`]. Anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Integer),
            Value::String(s) => Self::parse(s),
            _ => None,
        }
    }

    /// Parse the persisted text form produced by `Display`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            return Some(Self::Integer(i));
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(Self::Timestamp(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| Self::Timestamp(naive.and_utc()))
    }

    /// Render the marker as a SQL literal suitable for comparison against the
    /// marker column.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Integer(i) => i.to_string(),
            Self::Timestamp(ts) => format!("'{}'::timestamptz", ts.to_rfc3339()),
        }
    }

    /// The larger of two optional markers.
    pub fn max_of(current: Option<Marker>, candidate: Option<Marker>) -> Option<Marker> {
        match (current, candidate) {
            (Some(a), Some(b)) => Some(if b > a { b } else { a }),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

impl PartialOrd for Marker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Marker {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            // A pipeline uses a single marker kind; mixed kinds only need a total order.
            (Self::Integer(_), Self::Timestamp(_)) => Ordering::Less,
            (Self::Timestamp(_), Self::Integer(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}
