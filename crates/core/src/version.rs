//! Version tokens for optimistic concurrency
//!
//! A [`Version`] is opaque to the lifecycle core. Only the store decides how
//! two tokens relate, through `compare_version`, which answers with a
//! [`VersionOrdering`]. The helpers here map tokens to and from the value a
//! class keeps in its version field.

use crate::meta::TypeCode;
use crate::value::FieldValue;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Store-defined version token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Per-instance mutation counter
    Counter(u64),
    /// Last-modified timestamp in microseconds since the epoch
    Timestamp(i64),
    /// Opaque token (hash, etag); only equality is meaningful
    Token(String),
}

/// Relation between two version tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionOrdering {
    /// Tokens are equal
    Same,
    /// First token is newer than the second
    Later,
    /// First token is older than the second
    Earlier,
    /// Tokens differ but are not ordered
    Different,
}

impl Version {
    /// Counter version starting point
    pub const fn initial_counter() -> Self {
        Version::Counter(1)
    }

    /// Compare using the natural ordering of the token kinds.
    ///
    /// Counters and timestamps are ordered; tokens and mixed kinds only
    /// distinguish equal from different.
    pub fn compare(&self, other: &Version) -> VersionOrdering {
        let ord = match (self, other) {
            (Version::Counter(a), Version::Counter(b)) => a.cmp(b),
            (Version::Timestamp(a), Version::Timestamp(b)) => a.cmp(b),
            _ if self == other => Ordering::Equal,
            _ => return VersionOrdering::Different,
        };
        match ord {
            Ordering::Equal => VersionOrdering::Same,
            Ordering::Greater => VersionOrdering::Later,
            Ordering::Less => VersionOrdering::Earlier,
        }
    }

    /// Next token after this one, for stores that generate versions
    pub fn next(&self, now: DateTime<Utc>) -> Version {
        match self {
            Version::Counter(n) => Version::Counter(n + 1),
            Version::Timestamp(ts) => Version::Timestamp((*ts + 1).max(now.timestamp_micros())),
            Version::Token(t) => Version::Token(format!("{}'", t)),
        }
    }

    /// Value to keep in a version field of the given type
    pub fn to_field_value(&self, type_code: TypeCode) -> FieldValue {
        match (self, type_code) {
            (Version::Counter(n), TypeCode::Int) => FieldValue::Int(*n as i32),
            (Version::Counter(n), TypeCode::Short) => FieldValue::Short(*n as i16),
            (Version::Counter(n), _) => FieldValue::Long(*n as i64),
            (Version::Timestamp(us), TypeCode::Date) => Utc
                .timestamp_micros(*us)
                .single()
                .map(FieldValue::Date)
                .unwrap_or(FieldValue::Long(*us)),
            (Version::Timestamp(us), _) => FieldValue::Long(*us),
            (Version::Token(t), _) => FieldValue::String(t.clone()),
        }
    }

    /// Token recovered from a version field value; `None` when the field
    /// holds no version (null)
    pub fn from_field_value(value: &FieldValue) -> Option<Version> {
        match value {
            FieldValue::Short(n) => Some(Version::Counter(*n as u64)),
            FieldValue::Int(n) => Some(Version::Counter(*n as u64)),
            FieldValue::Long(n) => Some(Version::Counter(*n as u64)),
            FieldValue::Date(d) => Some(Version::Timestamp(d.timestamp_micros())),
            FieldValue::String(s) => Some(Version::Token(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Counter(n) => write!(f, "v{}", n),
            Version::Timestamp(ts) => write!(f, "ts{}", ts),
            Version::Token(t) => write!(f, "'{}'", t),
        }
    }
}
