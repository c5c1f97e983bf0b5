//! Core types for Tessera
//!
//! This crate defines the foundational types used throughout the system:
//! - Error: Error type hierarchy, including the driver's fatal/recoverable errors
//! - Segment / SegmentId / SegmentStamp: Declared transaction scopes and their versions
//! - SqlValue / Row / QueryResult: Data exchanged with the driver
//! - Dialect: SQL syntax differences between supported server families

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dialect;
pub mod error;
pub mod types;
pub mod value;

pub use dialect::Dialect;
pub use error::{DriverError, Error, Result};
pub use types::{EndTransaction, Segment, SegmentId, SegmentStamp, TransactionMode};
pub use value::{QueryResult, Row, SqlValue};
