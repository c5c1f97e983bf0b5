//! Segment transaction monitor
//!
//! `SegmentMonitor` is the process-wide service; every transaction asks it
//! for a `TransactionMonitor` right after `START TRANSACTION`. Allocation:
//!
//! 1. Build the lock plan from the declared segments (write wins over read)
//! 2. Acquire all segment locks in ascending `SegmentId` order
//! 3. Load the stamps of all segments through the `VersionStore`
//! 4. Aggregate them into the transaction's current version
//!
//! Because stamps are read only after every lock is held, the aggregate is
//! the state at the moment the transaction gained its locks. Locks are held
//! until the `TransactionMonitor` is released or dropped.

use crate::lock_table::{HeldLock, LockMode, SegmentLockTable};
use crate::version_store::{MemoryVersionStore, VersionStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_connection::Connection;
use tessera_core::{Error, Result, Segment, SegmentId, SegmentStamp};
use tracing::{debug, info, warn};

/// Monitor tuning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Upper bound for acquiring all locks of one transaction (None = wait forever)
    pub lock_timeout: Option<Duration>,
}

/// Lock plan for a set of declared segments
///
/// Read segments get shared locks, write segments exclusive ones; a segment
/// declared in both lists is locked exclusively. The map's order is the
/// acquisition order.
pub fn lock_plan(read: &[Segment], write: &[Segment]) -> BTreeMap<SegmentId, LockMode> {
    let mut plan = BTreeMap::new();
    for segment in read {
        plan.insert(segment.id(), LockMode::Shared);
    }
    for segment in write {
        plan.insert(segment.id(), LockMode::Exclusive);
    }
    plan
}

/// Process-wide segment lock and version service
pub struct SegmentMonitor {
    locks: Arc<SegmentLockTable>,
    store: Arc<dyn VersionStore>,
    options: MonitorOptions,
    active: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl SegmentMonitor {
    /// Monitor persisting versions through `store`
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self::with_options(store, MonitorOptions::default())
    }

    /// Monitor with explicit options
    pub fn with_options(store: Arc<dyn VersionStore>, options: MonitorOptions) -> Self {
        Self {
            locks: Arc::new(SegmentLockTable::new()),
            store,
            options,
            active: Arc::new(AtomicUsize::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Monitor keeping versions in process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryVersionStore::new()))
    }

    /// Configured options
    pub fn options(&self) -> MonitorOptions {
        self.options
    }

    /// Underlying lock table
    pub fn lock_table(&self) -> &SegmentLockTable {
        &self.locks
    }

    /// Number of transaction monitors not yet released
    pub fn active_monitors(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// True once `shutdown()` was called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Lock the declared segments and load their versions
    ///
    /// # Errors
    /// - `Error::Shutdown` after `shutdown()`
    /// - `Error::Programming` unless `conn` has an active transaction
    /// - `Error::LockTimeout` when the configured lock timeout passes
    /// - Any version store error; locks acquired so far are released
    pub async fn monitor_transaction(
        &self,
        conn: &mut Connection,
        read: &[Segment],
        write: &[Segment],
    ) -> Result<TransactionMonitor> {
        if self.is_shut_down() {
            return Err(Error::shutdown("segment monitor"));
        }
        if !conn.in_transaction() {
            return Err(Error::programming(format!(
                "cannot monitor {} without an active transaction (status {})",
                conn.session_id(),
                conn.status()
            )));
        }

        let plan = lock_plan(read, write);
        let held = self
            .locks
            .acquire_all(&plan, self.options.lock_timeout)
            .await?;

        let segments: Vec<(SegmentId, LockMode)> =
            plan.iter().map(|(id, mode)| (id.clone(), *mode)).collect();
        let stamps = match self.store.load(conn, &segments).await {
            Ok(stamps) => stamps,
            Err(e) => {
                drop(held);
                self.locks.prune(plan.keys());
                return Err(e);
            }
        };
        let current = SegmentStamp::aggregate(stamps.values().copied());

        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(
            target: "tessera::monitor",
            session = %conn.session_id(),
            segments = plan.len(),
            version = current.version,
            "Transaction monitor allocated"
        );
        Ok(TransactionMonitor {
            session_id: conn.session_id().to_string(),
            locks: Arc::clone(&self.locks),
            store: Arc::clone(&self.store),
            active: Arc::clone(&self.active),
            held,
            plan,
            current,
            updated: BTreeSet::new(),
            save: SaveState::NotSaved,
            released: false,
        })
    }

    /// Reject further monitor allocations
    ///
    /// Monitors already handed out keep their locks until released.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Err(Error::programming("segment monitor already shut down"));
        }
        info!(
            target: "tessera::monitor",
            active = self.active_monitors(),
            "Segment monitor shut down"
        );
        Ok(())
    }
}

impl fmt::Debug for SegmentMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentMonitor")
            .field("options", &self.options)
            .field("active", &self.active_monitors())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveState {
    NotSaved,
    Attempted,
    Saved(SegmentStamp),
}

/// Locks and version state of one running transaction
pub struct TransactionMonitor {
    session_id: String,
    locks: Arc<SegmentLockTable>,
    store: Arc<dyn VersionStore>,
    active: Arc<AtomicUsize>,
    held: Vec<HeldLock>,
    plan: BTreeMap<SegmentId, LockMode>,
    current: SegmentStamp,
    updated: BTreeSet<SegmentId>,
    save: SaveState,
    released: bool,
}

impl TransactionMonitor {
    /// Session of the connection this monitor is bound to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Aggregate version of all monitored segments
    pub fn current_version(&self) -> u64 {
        self.current.version
    }

    /// Latest modification time of all monitored segments
    pub fn current_last_modified(&self) -> Option<DateTime<Utc>> {
        self.current.last_modified
    }

    /// Aggregate stamp of all monitored segments
    pub fn current_stamp(&self) -> SegmentStamp {
        self.current
    }

    /// Segments held with a shared lock
    pub fn read_segments(&self) -> Vec<SegmentId> {
        self.segments_with(LockMode::Shared)
    }

    /// Segments held with an exclusive lock
    pub fn write_segments(&self) -> Vec<SegmentId> {
        self.segments_with(LockMode::Exclusive)
    }

    fn segments_with(&self, mode: LockMode) -> Vec<SegmentId> {
        self.plan
            .iter()
            .filter(|(_, m)| **m == mode)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Segments marked as modified so far
    pub fn updated_segments(&self) -> Vec<SegmentId> {
        self.updated.iter().cloned().collect()
    }

    /// Stamp written by `save_segment_updates`, once it succeeded
    pub fn saved_stamp(&self) -> Option<SegmentStamp> {
        match self.save {
            SaveState::Saved(stamp) => Some(stamp),
            _ => None,
        }
    }

    /// True once the locks were given back
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Mark a write segment as modified by this transaction
    ///
    /// Marking the same segment twice has no further effect.
    ///
    /// # Errors
    /// `Error::Programming` if the segment is not held exclusively, or the
    /// monitor was already saved or released.
    pub fn add_segment_update(&mut self, segment: &Segment) -> Result<()> {
        if self.released {
            return Err(Error::programming("segment update on a released monitor"));
        }
        if self.save != SaveState::NotSaved {
            return Err(Error::programming(
                "segment update after segment versions were saved",
            ));
        }
        let id = segment.id();
        if self.plan.get(&id) != Some(&LockMode::Exclusive) {
            return Err(Error::programming(format!(
                "segment '{}' was not declared as a write segment",
                id
            )));
        }
        self.updated.insert(id);
        Ok(())
    }

    /// Persist a new stamp for every updated segment
    ///
    /// Without updates nothing is written and the current stamp is returned.
    /// Otherwise the new stamp has `current_version() + 1` and a timestamp
    /// no earlier than `current_last_modified()`.
    ///
    /// # Errors
    /// - `Error::Programming` on a second call, a released monitor, another
    ///   session's connection, or a connection without an active transaction
    /// - Any version store error
    pub async fn save_segment_updates(&mut self, conn: &mut Connection) -> Result<SegmentStamp> {
        if self.released {
            return Err(Error::programming("save on a released monitor"));
        }
        if self.save != SaveState::NotSaved {
            return Err(Error::programming("segment updates already saved"));
        }
        if conn.session_id() != self.session_id {
            return Err(Error::programming(format!(
                "monitor of {} cannot save through {}",
                self.session_id,
                conn.session_id()
            )));
        }
        if !conn.in_transaction() {
            return Err(Error::programming(format!(
                "cannot save segment versions on {} in status {}",
                conn.session_id(),
                conn.status()
            )));
        }

        self.save = SaveState::Attempted;
        if self.updated.is_empty() {
            self.save = SaveState::Saved(self.current);
            return Ok(self.current);
        }

        let stamp = self.current.successor(Utc::now());
        let segments: Vec<SegmentId> = self.updated.iter().cloned().collect();
        self.store.save(conn, &segments, stamp).await?;
        self.save = SaveState::Saved(stamp);
        debug!(
            target: "tessera::monitor",
            session = %self.session_id,
            segments = segments.len(),
            version = stamp.version,
            "Segment updates saved"
        );
        Ok(stamp)
    }

    /// Give back every segment lock
    ///
    /// A second call only logs a warning.
    pub fn release(&mut self) {
        if self.released {
            warn!(target: "tessera::monitor", session = %self.session_id, "Transaction monitor released twice");
            return;
        }
        self.released = true;
        self.held.clear();
        self.locks.prune(self.plan.keys());
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(target: "tessera::monitor", session = %self.session_id, "Transaction monitor released");
    }
}

impl fmt::Debug for TransactionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionMonitor")
            .field("session_id", &self.session_id)
            .field("plan", &self.plan)
            .field("current", &self.current)
            .field("updated", &self.updated)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for TransactionMonitor {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}
