//! Transaction lifecycle counters
//!
//! `TransactionCounters` is shared by every transaction of a `Database` (or
//! owned by a standalone `Transaction`). A run counts as started once
//! `START TRANSACTION` succeeded and as committed or rolled back when it
//! settles.
//!
//! # Memory Ordering
//!
//! The counters are purely observational and use Relaxed ordering; the
//! atomic operations guarantee no torn reads or writes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live transaction counters
#[derive(Debug, Default)]
pub struct TransactionCounters {
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_rolled_back: AtomicU64,
}

impl TransactionCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction start
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a commit
    pub fn record_commit(&self) {
        self.finish();
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rollback
    pub fn record_rollback(&self) {
        self.finish();
        self.total_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self) {
        // Saturating decrement
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_rolled_back: self.total_rolled_back.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Transaction metrics
///
/// Provides statistics about transaction lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    /// Number of transactions between begin and commit/rollback
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions rolled back
    pub total_rolled_back: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that settled (committed + rolled back)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_rolled_back
    }

    /// Rollback rate (rolled back / started)
    pub fn rollback_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_rolled_back as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
