//! Process-wide segment lock table
//!
//! One fair async read/write lock per segment id. Tokio's `RwLock` queues
//! requests in FIFO order: once a writer waits, readers arriving after it
//! queue behind it, so a steady stream of readers cannot starve writers.
//!
//! Locks of one transaction are always taken in ascending `SegmentId`
//! order. Two transactions with overlapping segment sets therefore contend
//! on the smallest shared segment first and can never wait on each other in
//! a cycle.
//!
//! Entries are created on first use and pruned once no guard or waiter
//! references them, so the table does not grow with every segment ever
//! touched.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{Error, Result, SegmentId};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// Lock strength requested for a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared lock; segment is only read
    Shared,
    /// Exclusive lock; segment may be written
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

enum Guard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// A lock held on one segment; released on drop
pub struct HeldLock {
    segment: SegmentId,
    _guard: Guard,
}

impl HeldLock {
    /// Segment this lock protects
    pub fn segment(&self) -> &SegmentId {
        &self.segment
    }

    /// Strength of the held lock
    pub fn mode(&self) -> LockMode {
        match self._guard {
            Guard::Shared(_) => LockMode::Shared,
            Guard::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock")
            .field("segment", &self.segment)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Table of per-segment read/write locks
#[derive(Default)]
pub struct SegmentLockTable {
    locks: DashMap<SegmentId, Arc<RwLock<()>>>,
}

impl SegmentLockTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, segment: &SegmentId) -> Arc<RwLock<()>> {
        let entry = self
            .locks
            .entry(segment.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())));
        Arc::clone(entry.value())
    }

    /// Wait for one segment lock
    pub async fn acquire(&self, segment: &SegmentId, mode: LockMode) -> HeldLock {
        let lock = self.lock_for(segment);
        let guard = match mode {
            LockMode::Shared => Guard::Shared(lock.read_owned().await),
            LockMode::Exclusive => Guard::Exclusive(lock.write_owned().await),
        };
        HeldLock {
            segment: segment.clone(),
            _guard: guard,
        }
    }

    /// Acquire every lock of a plan in ascending segment order
    ///
    /// With a timeout, the whole plan shares one deadline. When it passes,
    /// locks acquired so far are released and `Error::LockTimeout` names the
    /// segment that was being waited for.
    pub async fn acquire_all(
        &self,
        plan: &BTreeMap<SegmentId, LockMode>,
        timeout: Option<Duration>,
    ) -> Result<Vec<HeldLock>> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut held = Vec::with_capacity(plan.len());

        for (segment, mode) in plan {
            let lock = match deadline {
                None => self.acquire(segment, *mode).await,
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.acquire(segment, *mode)).await {
                        Ok(lock) => lock,
                        Err(_) => {
                            drop(held);
                            self.prune(plan.keys());
                            return Err(Error::LockTimeout {
                                segment: segment.to_string(),
                                waited_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                    }
                }
            };
            debug!(target: "tessera::monitor", segment = %segment, mode = %mode, "Segment lock acquired");
            held.push(lock);
        }
        Ok(held)
    }

    /// Drop entries nobody holds or waits for
    pub fn prune<'a, I>(&self, segments: I)
    where
        I: IntoIterator<Item = &'a SegmentId>,
    {
        for segment in segments {
            self.locks
                .remove_if(segment, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// Number of segments with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no segment lock is tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Segment;

    fn id(name: &str) -> SegmentId {
        Segment::new(name).id()
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let table = SegmentLockTable::new();
        let a = table.acquire(&id("orders"), LockMode::Shared).await;
        let b = table.acquire(&id("orders"), LockMode::Shared).await;
        assert_eq!(a.mode(), LockMode::Shared);
        assert_eq!(b.segment(), &id("orders"));
    }

    #[tokio::test]
    async fn test_exclusive_blocks_shared() {
        let table = Arc::new(SegmentLockTable::new());
        let writer = table.acquire(&id("orders"), LockMode::Exclusive).await;

        let reader = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.acquire(&id("orders"), LockMode::Shared).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        drop(writer);
        let lock = reader.await.unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
    }

    #[tokio::test]
    async fn test_waiting_writer_blocks_new_readers() {
        let table = Arc::new(SegmentLockTable::new());
        let first_reader = table.acquire(&id("s"), LockMode::Shared).await;

        let writer = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.acquire(&id("s"), LockMode::Exclusive).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let late_reader = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.acquire(&id("s"), LockMode::Shared).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());
        assert!(!late_reader.is_finished());

        drop(first_reader);
        let writer_lock = writer.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!late_reader.is_finished());

        drop(writer_lock);
        late_reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_all_times_out_and_releases() {
        let table = SegmentLockTable::new();
        let blocker = table.acquire(&id("b"), LockMode::Exclusive).await;

        let plan: BTreeMap<_, _> = [
            (id("a"), LockMode::Exclusive),
            (id("b"), LockMode::Shared),
        ]
        .into_iter()
        .collect();
        let err = table
            .acquire_all(&plan, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { ref segment, .. } if segment == "b"));

        // "a" was released and pruned; "b" is still held by the blocker.
        assert_eq!(table.len(), 1);
        let a = table.acquire(&id("a"), LockMode::Exclusive).await;
        drop(a);
        drop(blocker);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_entries() {
        let table = SegmentLockTable::new();
        let held = table.acquire(&id("x"), LockMode::Shared).await;
        table.acquire(&id("y"), LockMode::Shared).await;

        table.prune([id("x"), id("y")].iter());
        assert_eq!(table.len(), 1);
        drop(held);
        table.prune([id("x")].iter());
        assert!(table.is_empty());
    }
}
