//! Core types for Tessera
//!
//! This module defines the foundational types:
//! - Segment: A declared read/write scope within a record collection
//! - SegmentId: Canonical, totally ordered segment identity
//! - SegmentStamp: Version and last-modified metadata of a segment
//! - TransactionMode: Read-only or read/write transaction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identity of a segment
///
/// Format: `"record_type"` or `"record_type:key"`, where `\` and `:` inside
/// the record type are escaped as `\\` and `\:`. The first unescaped `:`
/// separates the key, so distinct segments never share an id. Ordering is
/// plain string ordering and is what lock acquisition is sorted by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(String);

impl SegmentId {
    /// Wrap an already canonical identity (e.g. read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named, keyed subset of a record collection
///
/// Steps declare the segments they read and write before they run, which
/// lets the monitor compute every lock up front.
///
/// A keyed segment and the unkeyed segment of the same record type are
/// distinct lock and version units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    /// Record type descriptor (e.g. table or entity name)
    pub record_type: String,
    /// Optional key predicate narrowing the segment
    pub key: Option<String>,
}

impl Segment {
    /// Segment covering all records of a type
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            key: None,
        }
    }

    /// Segment covering the records of a type matching `key`
    pub fn keyed(record_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            key: Some(key.into()),
        }
    }

    /// Canonical identity of this segment
    pub fn id(&self) -> SegmentId {
        let mut raw = String::with_capacity(self.record_type.len());
        for ch in self.record_type.chars() {
            if matches!(ch, '\\' | ':') {
                raw.push('\\');
            }
            raw.push(ch);
        }
        if let Some(key) = &self.key {
            raw.push(':');
            raw.push_str(key);
        }
        SegmentId(raw)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Version metadata of one segment, or the aggregate over several
///
/// A segment that was never written has version 0 and no timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentStamp {
    /// Monotonically increasing version
    pub version: u64,
    /// Time of the last committed modification
    pub last_modified: Option<DateTime<Utc>>,
}

impl SegmentStamp {
    /// Create a stamp
    pub fn new(version: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            version,
            last_modified,
        }
    }

    /// Combine two stamps: maximum version, latest timestamp
    pub fn merge(self, other: SegmentStamp) -> SegmentStamp {
        SegmentStamp {
            version: self.version.max(other.version),
            last_modified: match (self.last_modified, other.last_modified) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }

    /// Aggregate a set of stamps
    pub fn aggregate<I: IntoIterator<Item = SegmentStamp>>(stamps: I) -> SegmentStamp {
        stamps
            .into_iter()
            .fold(SegmentStamp::default(), SegmentStamp::merge)
    }

    /// The stamp that follows this one when a transaction modifies segments
    ///
    /// The timestamp never moves backwards even if the wall clock does.
    pub fn successor(self, now: DateTime<Utc>) -> SegmentStamp {
        SegmentStamp {
            version: self.version + 1,
            last_modified: Some(match self.last_modified {
                Some(prev) if prev > now => prev,
                _ => now,
            }),
        }
    }
}

/// Access mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// No writes; `START TRANSACTION READ ONLY`
    ReadOnly,
    /// `START TRANSACTION READ WRITE`
    ReadWrite,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "read-only"),
            TransactionMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// How to end a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndTransaction {
    /// `COMMIT`
    Commit,
    /// `ROLLBACK`
    Rollback,
}
