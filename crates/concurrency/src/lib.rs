//! Concurrency control for Tessera
//!
//! This crate implements segment-level pessimistic locking plus version
//! stamps for optimistic checks by application code:
//! - SegmentLockTable: Fair shared/exclusive locks, acquired in canonical order
//! - VersionStore: Persistence of per-segment version stamps
//! - SegmentMonitor: Allocates a TransactionMonitor per running transaction
//! - TransactionMonitor: Held locks, aggregate version, and pending updates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock_table;
pub mod monitor;
pub mod version_store;

pub use lock_table::{HeldLock, LockMode, SegmentLockTable};
pub use monitor::{lock_plan, MonitorOptions, SegmentMonitor, TransactionMonitor};
pub use version_store::{
    MemoryVersionStore, SqlVersionStore, VersionStore, DEFAULT_VERSION_TABLE,
};
