//! Bounded connection pool
//!
//! At most `connection_limit` connections are checked out at once. Further
//! callers wait in FIFO order on a fair semaphore; with a non-zero
//! `queue_limit`, a caller arriving while that many callers already wait is
//! rejected immediately.
//!
//! Idle physical sessions are reused most-recently-released first. A
//! released connection carrying a fatal error is destroyed and its slot
//! freed, so the next caller opens a fresh session.

use crate::connection::Connection;
use crate::driver::{Driver, PhysicalConnection};
use crate::provider::{detect_dialect, ConnectionProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::{Dialect, DriverError, Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

/// Pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of simultaneously checked-out connections
    pub connection_limit: usize,
    /// Maximum number of waiting callers (0 = unbounded)
    pub queue_limit: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connection_limit: 10,
            queue_limit: 0,
        }
    }
}

/// Pool counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions open and idle in the pool
    pub idle: usize,
    /// Connections currently checked out
    pub checked_out: usize,
    /// Callers waiting for a slot
    pub waiting: usize,
}

struct PoolShared {
    driver: Arc<dyn Driver>,
    options: PoolOptions,
    dialect: Dialect,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn PhysicalConnection>>>,
    waiting: AtomicUsize,
    shut_down: AtomicBool,
}

impl PoolShared {
    fn reclaim(&self, mut physical: Box<dyn PhysicalConnection>, fatal: Option<DriverError>) {
        if let Some(fatal) = fatal {
            debug!(target: "tessera::pool", thread_id = physical.thread_id(), error = %fatal, "Destroying fatal connection");
            physical.destroy();
            return;
        }
        // Shutdown sets the flag while holding the idle lock
        let mut idle = self.idle.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            drop(idle);
            debug!(target: "tessera::pool", thread_id = physical.thread_id(), "Destroying connection released after shutdown");
            physical.destroy();
        } else {
            idle.push(physical);
        }
    }
}

/// Decrements the waiter count however the wait ends
struct WaitTicket<'a>(&'a AtomicUsize);

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Provider backed by a bounded pool of physical sessions
pub struct PoolProvider {
    shared: Arc<PoolShared>,
}

impl PoolProvider {
    /// Build a pool and detect the server dialect
    ///
    /// Opens a probe session, classifies the server version, and keeps the
    /// probe as the first idle connection.
    ///
    /// # Errors
    /// - `Error::Config` if `connection_limit` is 0
    /// - Driver error if the probe cannot connect
    /// - `Error::UnsupportedServer`; the probe is destroyed first
    pub async fn connect(driver: Arc<dyn Driver>, options: PoolOptions) -> Result<Self> {
        if options.connection_limit == 0 {
            return Err(Error::config("connection_limit must be at least 1"));
        }

        let mut probe = driver.connect().await?;
        let dialect = detect_dialect(&mut probe)?;

        let shared = Arc::new(PoolShared {
            driver,
            options,
            dialect,
            permits: Arc::new(Semaphore::new(options.connection_limit)),
            idle: Mutex::new(vec![probe]),
            waiting: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        });
        info!(
            target: "tessera::pool",
            connection_limit = options.connection_limit,
            queue_limit = options.queue_limit,
            %dialect,
            "Connection pool ready"
        );
        Ok(Self { shared })
    }

    /// Current pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.shared.idle.lock().len(),
            checked_out: self.shared.options.connection_limit
                - self.shared.permits.available_permits(),
            waiting: self.shared.waiting.load(Ordering::SeqCst),
        }
    }

    /// Configured sizing
    pub fn options(&self) -> PoolOptions {
        self.shared.options
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let shared = &self.shared;
        match Arc::clone(&shared.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(Error::shutdown("connection pool")),
            Err(TryAcquireError::NoPermits) => {}
        }

        let already_waiting = shared.waiting.fetch_add(1, Ordering::SeqCst);
        let _ticket = WaitTicket(&shared.waiting);
        let limit = shared.options.queue_limit;
        if limit > 0 && already_waiting >= limit {
            return Err(Error::QueueLimit { limit });
        }

        debug!(target: "tessera::pool", waiting = already_waiting + 1, "Waiting for a free connection");
        Arc::clone(&shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::shutdown("connection pool"))
    }
}

#[async_trait]
impl ConnectionProvider for PoolProvider {
    async fn get_connection(&self) -> Result<Connection> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(Error::shutdown("connection pool"));
        }

        let permit = self.acquire_permit().await?;
        let reused = self.shared.idle.lock().pop();
        let physical = match reused {
            Some(physical) => physical,
            None => {
                let physical = self.shared.driver.connect().await?;
                debug!(target: "tessera::pool", thread_id = physical.thread_id(), "Opened new connection");
                physical
            }
        };

        let shared = Arc::clone(&self.shared);
        Ok(Connection::new(
            physical,
            self.shared.dialect,
            Box::new(move |physical, fatal| {
                shared.reclaim(physical, fatal);
                drop(permit);
            }),
        ))
    }

    fn dialect(&self) -> Dialect {
        self.shared.dialect
    }

    async fn shutdown(&self) -> Result<()> {
        let idle: Vec<_> = {
            let mut idle = self.shared.idle.lock();
            if self.shared.shut_down.swap(true, Ordering::SeqCst) {
                return Err(Error::programming("connection pool already shut down"));
            }
            std::mem::take(&mut *idle)
        };
        self.shared.permits.close();

        let closed = idle.len();
        for mut physical in idle {
            if let Err(e) = physical.end().await {
                warn!(target: "tessera::pool", thread_id = physical.thread_id(), error = %e, "Graceful close failed; destroying");
                physical.destroy();
            }
        }
        info!(target: "tessera::pool", closed, "Connection pool shut down");
        Ok(())
    }

    fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use std::time::Duration;
    use tessera_core::{EndTransaction, TransactionMode};

    async fn pool(driver: &MockDriver, limit: usize, queue: usize) -> PoolProvider {
        PoolProvider::connect(
            Arc::new(driver.clone()),
            PoolOptions {
                connection_limit: limit,
                queue_limit: queue,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_probe_is_reused() {
        let driver = MockDriver::new("5.7.34");
        let pool = pool(&driver, 2, 0).await;
        assert_eq!(pool.dialect(), Dialect::MySql56);
        assert_eq!(pool.stats().idle, 1);

        let mut conn = pool.get_connection().await.unwrap();
        assert_eq!(driver.opened(), 1);
        conn.release().unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_unsupported_server_tears_down_probe() {
        let driver = MockDriver::new("8.0.1");
        let err = PoolProvider::connect(Arc::new(driver.clone()), PoolOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedServer { .. }));
        assert_eq!(driver.opened(), 1);
        assert_eq!(driver.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let driver = MockDriver::new("5.7.34");
        let err = PoolProvider::connect(
            Arc::new(driver.clone()),
            PoolOptions {
                connection_limit: 0,
                queue_limit: 0,
            },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(driver.opened(), 0);
    }

    #[tokio::test]
    async fn test_limit_blocks_until_release() {
        let driver = MockDriver::new("10.5.8-MariaDB");
        let pool = Arc::new(pool(&driver, 1, 0).await);

        let mut first = pool.get_connection().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_connection().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().waiting, 1);

        let session = first.session_id().to_string();
        first.release().unwrap();
        let mut second = waiter.await.unwrap().unwrap();
        assert_eq!(second.session_id(), session);
        second.release().unwrap();
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_queue_limit_rejects_immediately() {
        let driver = MockDriver::new("5.7.34");
        let pool = Arc::new(pool(&driver, 1, 1).await);

        let mut held = pool.get_connection().await.unwrap();
        let queued = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_connection().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = pool.get_connection().await.unwrap_err();
        assert_eq!(err, Error::QueueLimit { limit: 1 });

        held.release().unwrap();
        queued.await.unwrap().unwrap().release().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_connection_destroyed_on_release() {
        let driver = MockDriver::new("5.7.34");
        driver.fail_on("START TRANSACTION", DriverError::fatal("broken pipe"));
        let pool = pool(&driver, 1, 0).await;

        let mut conn = pool.get_connection().await.unwrap();
        conn.begin_transaction(TransactionMode::ReadWrite).await.unwrap_err();
        conn.release().unwrap();
        assert_eq!(driver.destroyed(), 1);
        assert_eq!(pool.stats().idle, 0);

        let mut fresh = pool.get_connection().await.unwrap();
        assert_eq!(driver.opened(), 2);
        fresh.begin_transaction(TransactionMode::ReadWrite).await.unwrap();
        fresh.end_transaction(EndTransaction::Commit).await.unwrap();
        fresh.release().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_one_shot_and_rejects_waiters() {
        let driver = MockDriver::new("5.7.34");
        let pool = Arc::new(pool(&driver, 1, 0).await);

        let mut held = pool.get_connection().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_connection().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown().await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Shutdown(_))));
        assert!(matches!(pool.get_connection().await, Err(Error::Shutdown(_))));
        assert!(pool.shutdown().await.unwrap_err().is_programming());

        held.release().unwrap();
        assert_eq!(driver.destroyed(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_releases_racing_shutdown_leave_no_session_behind() {
        for _ in 0..50 {
            let driver = MockDriver::new("5.7.34");
            let pool = Arc::new(pool(&driver, 8, 0).await);
            let mut held = Vec::new();
            for _ in 0..8 {
                held.push(pool.get_connection().await.unwrap());
            }

            let releases: Vec<_> = held
                .into_iter()
                .map(|mut conn| tokio::spawn(async move { conn.release().unwrap() }))
                .collect();
            pool.shutdown().await.unwrap();
            for release in releases {
                release.await.unwrap();
            }

            assert_eq!(pool.stats().idle, 0);
            assert_eq!(driver.live(), 0);
        }
    }
}
