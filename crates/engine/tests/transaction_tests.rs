//! End-to-end tests for tessera-engine
//!
//! These tests drive whole transactions through a provider, a monitor and a
//! scripted driver, and verify:
//!
//! 1. **Read-only runs** - No version save, one connection release
//! 2. **Failure handling** - Rollback and the original error on every failure path
//! 3. **Dialect detection** - Supported and unsupported servers at open
//! 4. **Database wiring** - Versions, metrics and statement order through `Database`
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test transaction_tests
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_concurrency::{LockMode, MemoryVersionStore, SegmentMonitor, VersionStore};
use tessera_connection::mock::MockDriver;
use tessera_connection::{Connection, ConnectionProvider, Driver};
use tessera_core::{
    Dialect, DriverError, Error, Result, Segment, SegmentId, SegmentStamp, TransactionMode,
};
use tessera_engine::{step_fn, Database, Step, TesseraConfig, Transaction, TransactionContext};

// ============================================================================
// Test Helpers
// ============================================================================

/// Provider handing out mock sessions and counting releases
struct TrackingProvider {
    driver: MockDriver,
    releases: Arc<AtomicUsize>,
}

impl TrackingProvider {
    fn new(driver: &MockDriver) -> Self {
        Self {
            driver: driver.clone(),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProvider for TrackingProvider {
    async fn get_connection(&self) -> Result<Connection> {
        let physical = self.driver.connect().await?;
        let releases = Arc::clone(&self.releases);
        Ok(Connection::new(
            physical,
            Dialect::MySql56,
            Box::new(move |_physical, _fatal| {
                releases.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql56
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn is_shut_down(&self) -> bool {
        false
    }
}

/// Memory store counting calls
#[derive(Default)]
struct CountingStore {
    inner: MemoryVersionStore,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

#[async_trait]
impl VersionStore for CountingStore {
    async fn load(
        &self,
        conn: &mut Connection,
        segments: &[(SegmentId, LockMode)],
    ) -> Result<HashMap<SegmentId, SegmentStamp>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(conn, segments).await
    }

    async fn save(
        &self,
        conn: &mut Connection,
        segments: &[SegmentId],
        stamp: SegmentStamp,
    ) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(conn, segments, stamp).await
    }
}

/// Log sink for a scoped subscriber
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

fn reader() -> impl Step<TransactionContext<()>, Output = usize> {
    step_fn(
        vec![Segment::new("accounts")],
        vec![],
        |conn, _monitor, _ctx: TransactionContext<()>| {
            Box::pin(async move {
                let rows = conn.execute_query("SELECT id FROM accounts").await?;
                Ok(rows.len())
            })
        },
    )
}

fn failing_writer() -> impl Step<TransactionContext<()>, Output = ()> {
    step_fn(
        vec![],
        vec![Segment::new("accounts")],
        |conn, monitor, _ctx: TransactionContext<()>| {
            Box::pin(async move {
                conn.execute_statement("UPDATE accounts SET balance = 0").await?;
                monitor.add_segment_update(&Segment::new("accounts"))?;
                Err(Error::step("insufficient funds"))
            })
        },
    )
}

fn memory_config() -> TesseraConfig {
    let mut config = TesseraConfig::default();
    config.monitor.store = "memory".to_string();
    config
}

// ============================================================================
// SECTION 1: Read-only Runs
// ============================================================================

mod read_only {
    use super::*;

    #[tokio::test]
    async fn read_only_run_skips_version_save_and_releases_once() {
        let driver = MockDriver::new("5.7.34");
        let provider = Arc::new(TrackingProvider::new(&driver));
        let store = Arc::new(CountingStore::default());
        let monitor = Arc::new(SegmentMonitor::new(store.clone()));
        let txn = Transaction::new(
            "balance-report",
            provider.clone() as Arc<dyn ConnectionProvider>,
            monitor,
            reader(),
        );
        assert_eq!(txn.mode(), TransactionMode::ReadOnly);

        assert_eq!(txn.execute(()).await.unwrap(), 0);

        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(driver.count("START TRANSACTION READ ONLY"), 1);
        assert_eq!(driver.count("COMMIT"), 1);
        assert_eq!(driver.count("ROLLBACK"), 0);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn read_write_run_saves_once() {
        let driver = MockDriver::new("5.7.34");
        let provider = Arc::new(TrackingProvider::new(&driver));
        let store = Arc::new(CountingStore::default());
        let txn = Transaction::new(
            "report-then-touch",
            provider.clone() as Arc<dyn ConnectionProvider>,
            Arc::new(SegmentMonitor::new(store.clone())),
            reader().then(step_fn(
                vec![],
                vec![Segment::new("audit")],
                |_conn, monitor, count: usize| {
                    Box::pin(async move {
                        monitor.add_segment_update(&Segment::new("audit"))?;
                        Ok(count)
                    })
                },
            )),
        );
        assert_eq!(txn.mode(), TransactionMode::ReadWrite);

        txn.execute(()).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(provider.releases(), 1);
    }
}

// ============================================================================
// SECTION 2: Failure Handling
// ============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn step_failure_rolls_back_and_returns_step_error() {
        let driver = MockDriver::new("5.7.34");
        let provider = Arc::new(TrackingProvider::new(&driver));
        let store = Arc::new(CountingStore::default());
        let monitor = Arc::new(SegmentMonitor::new(store.clone()));
        let txn = Transaction::new(
            "withdraw",
            provider.clone() as Arc<dyn ConnectionProvider>,
            Arc::clone(&monitor),
            failing_writer(),
        );

        let err = txn.execute(()).await.unwrap_err();

        assert_eq!(err, Error::step("insufficient funds"));
        assert_eq!(driver.count("ROLLBACK"), 1);
        assert_eq!(driver.count("COMMIT"), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(provider.releases(), 1);
        assert_eq!(monitor.active_monitors(), 0);

        let metrics = txn.metrics();
        assert_eq!(metrics.total_rolled_back, 1);
        assert_eq!(metrics.active_count, 0);
    }

    #[tokio::test]
    async fn rollback_failure_is_logged_and_step_error_returned() {
        let (logs, _guard) = capture_logs();
        let driver = MockDriver::new("5.7.34");
        driver.fail_on("ROLLBACK", DriverError::new("server has gone away"));
        let provider = Arc::new(TrackingProvider::new(&driver));
        let txn = Transaction::new(
            "withdraw",
            provider.clone() as Arc<dyn ConnectionProvider>,
            Arc::new(SegmentMonitor::in_memory()),
            failing_writer(),
        );

        let err = txn.execute(()).await.unwrap_err();

        assert_eq!(err, Error::step("insufficient funds"));
        assert_eq!(provider.releases(), 1);
        let output = logs.contents();
        assert!(output.contains("Rollback failed"), "logs: {output}");
        assert!(output.contains("server has gone away"), "logs: {output}");
    }

    #[tokio::test]
    async fn fatal_statement_error_destroys_session() {
        let driver = MockDriver::new("5.7.34");
        driver.fail_on("UPDATE", DriverError::fatal("connection reset"));
        let db = Database::open(memory_config(), Arc::new(driver.clone()))
            .await
            .unwrap();
        let txn = db.transaction("withdraw", failing_writer());

        let err = txn.execute(()).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(driver.count("ROLLBACK"), 0);
        assert_eq!(driver.destroyed(), 1);

        // The pool opens a fresh session for the next run
        let err = txn.execute(()).await.unwrap_err();
        assert_eq!(err, Error::step("insufficient funds"));
        assert_eq!(driver.opened(), 2);
        db.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn version_save_failure_rolls_back() {
        let driver = MockDriver::new("5.7.34");
        driver.fail_on("INSERT INTO `segment_versions`", DriverError::new("lock wait timeout"));
        let db = Database::open(TesseraConfig::default(), Arc::new(driver.clone()))
            .await
            .unwrap();
        let txn = db.transaction(
            "touch",
            step_fn(
                vec![],
                vec![Segment::new("orders")],
                |_conn, monitor, _ctx: TransactionContext<()>| {
                    Box::pin(async move { monitor.add_segment_update(&Segment::new("orders")) })
                },
            ),
        );

        let err = txn.execute(()).await.unwrap_err();
        assert_eq!(err, Error::Driver(DriverError::new("lock wait timeout")));
        assert_eq!(driver.count("ROLLBACK"), 1);
        assert_eq!(db.metrics().total_rolled_back, 1);
        db.shutdown().await.unwrap();
    }
}

// ============================================================================
// SECTION 3: Dialect Detection
// ============================================================================

mod dialects {
    use super::*;

    #[tokio::test]
    async fn supported_servers_open() {
        for (version, dialect) in [
            ("5.7.34", Dialect::MySql56),
            ("5.6.51-log", Dialect::MySql56),
            ("10.5.8-MariaDB", Dialect::MariaDb10),
            ("5.5.5-10.3.39-MariaDB-0+deb10u1", Dialect::MariaDb10),
        ] {
            let driver = MockDriver::new(version);
            let db = Database::open(memory_config(), Arc::new(driver.clone()))
                .await
                .unwrap();
            assert_eq!(db.dialect(), dialect, "version {version}");
            db.shutdown().await.unwrap();
            assert_eq!(driver.live(), 0);
        }
    }

    #[tokio::test]
    async fn unsupported_server_tears_down_pool() {
        let driver = MockDriver::new("8.0.1");
        let err = Database::open(memory_config(), Arc::new(driver.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedServer { .. }), "got {err:?}");
        assert_eq!(driver.opened(), 1);
        assert_eq!(driver.live(), 0);
    }

    #[tokio::test]
    async fn unsupported_server_tears_down_single() {
        let driver = MockDriver::new("8.0.1");
        let mut config = memory_config();
        config.provider.mode = "single".to_string();
        let err = Database::open(config, Arc::new(driver.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedServer { .. }), "got {err:?}");
        assert_eq!(driver.live(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let driver = MockDriver::new("5.7.34");
        driver.fail_connect(DriverError::fatal("connection refused").with_code("ECONNREFUSED"));
        let err = Database::open(memory_config(), Arc::new(driver.clone()))
            .await
            .unwrap_err();
        assert_eq!(
            err.driver_error().and_then(|e| e.code.as_deref()),
            Some("ECONNREFUSED")
        );
    }
}

// ============================================================================
// SECTION 4: Database Wiring
// ============================================================================

mod database {
    use super::*;

    fn bump() -> impl Step<TransactionContext<u64>, Output = u64> {
        step_fn(
            vec![Segment::new("customers")],
            vec![Segment::keyed("orders", "42")],
            |conn, monitor, ctx: TransactionContext<u64>| {
                Box::pin(async move {
                    conn.execute_statement("UPDATE orders SET qty = qty + 1 WHERE id = 42")
                        .await?;
                    monitor.add_segment_update(&Segment::keyed("orders", "42"))?;
                    Ok(*ctx.params() + monitor.current_version())
                })
            },
        )
    }

    #[tokio::test]
    async fn sql_store_statement_order() {
        let driver = MockDriver::new("5.7.34");
        let db = Database::open(TesseraConfig::default(), Arc::new(driver.clone()))
            .await
            .unwrap();
        driver.clear_statements();

        assert_eq!(db.transaction("bump", bump()).execute(1000).await.unwrap(), 1000);

        let statements = driver.statements();
        assert_eq!(statements.len(), 6, "{statements:#?}");
        assert_eq!(statements[0], "START TRANSACTION READ WRITE");
        assert!(statements[1].contains("LOCK IN SHARE MODE"));
        assert!(statements[1].contains("'customers'"));
        assert!(statements[2].contains("FOR UPDATE"));
        assert!(statements[2].contains("'orders:42'"));
        assert!(statements[3].starts_with("UPDATE orders"));
        assert!(statements[4].starts_with("INSERT INTO `segment_versions`"));
        assert!(statements[4].contains("('orders:42', 1,"));
        assert_eq!(statements[5], "COMMIT");
        db.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_see_increasing_versions() {
        let driver = MockDriver::new("10.5.8-MariaDB");
        let db = Arc::new(
            Database::open(memory_config(), Arc::new(driver.clone()))
                .await
                .unwrap(),
        );
        let txn = Arc::new(db.transaction("bump", bump()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let txn = Arc::clone(&txn);
            handles.push(tokio::spawn(async move { txn.execute(0).await }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<u64>>());

        let metrics = db.metrics();
        assert_eq!(metrics.total_committed, 8);
        assert_eq!(metrics.commit_rate, 1.0);
        assert_eq!(db.monitor().active_monitors(), 0);
        db.shutdown().await.unwrap();
        assert_eq!(driver.live(), 0);
    }

    #[tokio::test]
    async fn chained_steps_enrich_context() {
        let driver = MockDriver::new("5.7.34");
        let db = Database::open(memory_config(), Arc::new(driver.clone()))
            .await
            .unwrap();
        let load = step_fn(
            vec![Segment::new("accounts")],
            vec![],
            |_conn, monitor, ctx: TransactionContext<&'static str>| {
                Box::pin(async move {
                    let version = monitor.current_version();
                    Ok(ctx.map(|owner| (owner, version)))
                })
            },
        );
        let describe = step_fn(
            vec![],
            vec![],
            |_conn, _monitor, ctx: TransactionContext<(&'static str, u64)>| {
                Box::pin(async move {
                    let (owner, version) = ctx.params();
                    Ok(format!("{}@{} in {}", owner, version, ctx.name()))
                })
            },
        );
        let txn = db.transaction("describe", load.then(describe));

        assert_eq!(txn.mode(), TransactionMode::ReadOnly);
        assert_eq!(txn.execute("alice").await.unwrap(), "alice@0 in describe");
        db.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_runs() {
        let driver = MockDriver::new("5.7.34");
        let db = Database::open(memory_config(), Arc::new(driver.clone()))
            .await
            .unwrap();
        let txn = db.transaction("bump", bump());
        txn.execute(0).await.unwrap();

        db.shutdown().await.unwrap();
        assert!(db.services().is_shut_down());
        assert!(matches!(txn.execute(0).await, Err(Error::Shutdown(_))));
    }
}
