//! Scripted in-memory driver
//!
//! Records every statement, can be told to fail statements matching a
//! pattern, and answers queries through an optional responder. All sessions
//! opened by one `MockDriver` (and its clones) share the same state, which
//! makes it the driver of choice for tests of providers, the monitor, and
//! the transaction orchestrator.
//!
//! ```ignore
//! let driver = MockDriver::new("5.7.34");
//! driver.fail_on("COMMIT", DriverError::new("deadlock"));
//! let pool = PoolProvider::connect(Arc::new(driver.clone()), PoolOptions::default()).await?;
//! ```

use crate::driver::{Driver, PhysicalConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::{DriverError, QueryResult};

type Responder = Arc<dyn Fn(&str) -> Option<Result<QueryResult, DriverError>> + Send + Sync>;

struct FailureRule {
    pattern: String,
    error: DriverError,
    remaining: usize,
}

#[derive(Default)]
struct MockState {
    server_version: Mutex<String>,
    next_thread_id: AtomicU64,
    statements: Mutex<Vec<(u64, String)>>,
    failures: Mutex<Vec<FailureRule>>,
    connect_failure: Mutex<Option<DriverError>>,
    responder: Mutex<Option<Responder>>,
    opened: AtomicUsize,
    ended: AtomicUsize,
    destroyed: AtomicUsize,
}

impl MockState {
    fn take_failure(&self, sql: &str) -> Option<DriverError> {
        let mut failures = self.failures.lock();
        let index = failures.iter().position(|rule| sql.contains(&rule.pattern))?;
        let rule = &mut failures[index];
        let error = rule.error.clone();
        rule.remaining -= 1;
        if rule.remaining == 0 {
            failures.remove(index);
        }
        Some(error)
    }
}

/// Driver producing [`MockConnection`]s
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    /// Driver whose sessions report `server_version`
    pub fn new(server_version: &str) -> Self {
        let state = MockState {
            server_version: Mutex::new(server_version.to_string()),
            next_thread_id: AtomicU64::new(1),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Fail the next statement containing `pattern`
    pub fn fail_on(&self, pattern: &str, error: DriverError) {
        self.fail_on_times(pattern, error, 1);
    }

    /// Fail the next `times` statements containing `pattern`
    pub fn fail_on_times(&self, pattern: &str, error: DriverError, times: usize) {
        if times == 0 {
            return;
        }
        self.state.failures.lock().push(FailureRule {
            pattern: pattern.to_string(),
            error,
            remaining: times,
        });
    }

    /// Fail the next `connect()`
    pub fn fail_connect(&self, error: DriverError) {
        *self.state.connect_failure.lock() = Some(error);
    }

    /// Answer statements through `f`; `None` falls back to an empty result
    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&str) -> Option<Result<QueryResult, DriverError>> + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Arc::new(f));
    }

    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Statements executed on one session
    pub fn statements_for(&self, thread_id: u64) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .filter(|(id, _)| *id == thread_id)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Number of statements containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.state
            .statements
            .lock()
            .iter()
            .filter(|(_, sql)| sql.contains(pattern))
            .count()
    }

    /// Forget recorded statements
    pub fn clear_statements(&self) {
        self.state.statements.lock().clear();
    }

    /// Sessions opened
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Sessions closed gracefully
    pub fn ended(&self) -> usize {
        self.state.ended.load(Ordering::SeqCst)
    }

    /// Sessions destroyed
    pub fn destroyed(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    /// Sessions neither ended nor destroyed
    pub fn live(&self) -> usize {
        self.opened() - self.ended() - self.destroyed()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self) -> Result<Box<dyn PhysicalConnection>, DriverError> {
        if let Some(error) = self.state.connect_failure.lock().take() {
            return Err(error);
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            thread_id: self.state.next_thread_id.fetch_add(1, Ordering::SeqCst),
            server_version: self.state.server_version.lock().clone(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

/// Session of a [`MockDriver`]
pub struct MockConnection {
    thread_id: u64,
    server_version: String,
    state: Arc<MockState>,
    closed: bool,
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    fn server_version(&self) -> &str {
        &self.server_version
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, DriverError> {
        if self.closed {
            return Err(DriverError::fatal("Cannot enqueue Query after being destroyed"));
        }
        self.state
            .statements
            .lock()
            .push((self.thread_id, sql.to_string()));
        tokio::task::yield_now().await;

        if let Some(error) = self.state.take_failure(sql) {
            return Err(error);
        }
        let responder = self.state.responder.lock().clone();
        match responder.and_then(|f| f(sql)) {
            Some(result) => result,
            None => Ok(QueryResult::default()),
        }
    }

    async fn end(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.ended.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
