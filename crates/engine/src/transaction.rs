//! Transaction orchestrator
//!
//! A `Transaction` is a reusable definition: a name, a master step, and the
//! provider and monitor it runs against. Every `execute` call is one
//! independent run:
//!
//! 1. Acquire a connection
//! 2. `START TRANSACTION`, read-only when the master step writes nothing
//! 3. Allocate a monitor for the declared segments
//! 4. Run the master step
//! 5. Save segment versions (read/write runs only)
//! 6. `COMMIT`
//!
//! A failure after step 2 rolls back. A rollback failure is logged and the
//! original error is returned. The monitor is released after commit or
//! rollback, and the connection is released exactly once on every path.

use crate::context::TransactionContext;
use crate::metrics::{TransactionCounters, TransactionMetrics};
use crate::step::Step;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tessera_concurrency::{SegmentMonitor, TransactionMonitor};
use tessera_connection::{Connection, ConnectionProvider};
use tessera_core::{EndTransaction, Error, Result, TransactionMode};
use tracing::{debug, error, info_span, Instrument, Span};
use uuid::Uuid;

/// Reusable transaction definition
pub struct Transaction<S, P> {
    name: Arc<str>,
    step: S,
    provider: Arc<dyn ConnectionProvider>,
    monitor: Arc<SegmentMonitor>,
    counters: Arc<TransactionCounters>,
    _params: PhantomData<fn(P)>,
}

impl<S, P> Transaction<S, P>
where
    P: Send + 'static,
    S: Step<TransactionContext<P>>,
{
    /// Define a transaction running `step` as its master step
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ConnectionProvider>,
        monitor: Arc<SegmentMonitor>,
        step: S,
    ) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            step,
            provider,
            monitor,
            counters: Arc::new(TransactionCounters::new()),
            _params: PhantomData,
        }
    }

    /// Count runs in shared counters instead of private ones
    pub fn with_counters(mut self, counters: Arc<TransactionCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Transaction name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Master step
    pub fn step(&self) -> &S {
        &self.step
    }

    /// Mode every run begins with
    pub fn mode(&self) -> TransactionMode {
        if self.step.write_segments().is_empty() {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        }
    }

    /// Counters of the runs so far
    pub fn metrics(&self) -> TransactionMetrics {
        self.counters.metrics()
    }

    /// Run the transaction once
    ///
    /// # Errors
    /// The first failure of the run: connection acquisition, begin, monitor
    /// allocation, the step, the version save, or the commit.
    pub async fn execute(&self, params: P) -> Result<S::Output> {
        let run_id = Uuid::new_v4();
        let span = info_span!(target: "tessera::txn", "txn", %run_id, name = %self.name);
        self.run(run_id, params, span.clone()).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, params: P, span: Span) -> Result<S::Output> {
        let mut conn = self.provider.get_connection().await?;
        let mode = self.mode();

        if let Err(e) = conn.begin_transaction(mode).await {
            debug!(target: "tessera::txn", error = %e, "Begin failed");
            release_after_failure(&mut conn);
            return Err(e);
        }
        self.counters.record_start();

        let read = self.step.read_segments();
        let write = self.step.write_segments();
        let mut monitor = match self
            .monitor
            .monitor_transaction(&mut conn, &read, &write)
            .await
        {
            Ok(monitor) => monitor,
            Err(e) => return Err(self.abort(conn, None, e).await),
        };

        let ctx = TransactionContext::new(run_id, Arc::clone(&self.name), params, span);
        match self.run_to_commit(&mut conn, &mut monitor, ctx, mode).await {
            Ok(output) => {
                monitor.release();
                self.counters.record_commit();
                debug!(target: "tessera::txn", session = %conn.session_id(), "Transaction committed");
                conn.release()?;
                Ok(output)
            }
            Err(e) => Err(self.abort(conn, Some(monitor), e).await),
        }
    }

    async fn run_to_commit(
        &self,
        conn: &mut Connection,
        monitor: &mut TransactionMonitor,
        ctx: TransactionContext<P>,
        mode: TransactionMode,
    ) -> Result<S::Output> {
        let output = self.step.execute(conn, monitor, ctx).await?;
        if mode == TransactionMode::ReadWrite {
            monitor.save_segment_updates(conn).await?;
        }
        conn.end_transaction(EndTransaction::Commit).await?;
        Ok(output)
    }

    /// Roll back after `cause`, release everything, and hand `cause` back
    async fn abort(
        &self,
        mut conn: Connection,
        monitor: Option<TransactionMonitor>,
        cause: Error,
    ) -> Error {
        let was_fatal = conn.is_fatal();
        match conn.end_transaction(EndTransaction::Rollback).await {
            Ok(()) => {
                debug!(target: "tessera::txn", session = %conn.session_id(), error = %cause, "Transaction rolled back");
            }
            Err(rollback) if was_fatal => {
                debug!(target: "tessera::txn", session = %conn.session_id(), error = %rollback, "Rollback skipped on failed connection");
            }
            Err(rollback) => {
                error!(
                    target: "tessera::txn",
                    session = %conn.session_id(),
                    error = %rollback,
                    cause = %cause,
                    "Rollback failed"
                );
            }
        }

        if let Some(mut monitor) = monitor {
            monitor.release();
        }
        self.counters.record_rollback();
        release_after_failure(&mut conn);
        cause
    }
}

fn release_after_failure(conn: &mut Connection) {
    if let Err(e) = conn.release() {
        error!(target: "tessera::txn", session = %conn.session_id(), error = %e, "Connection release failed");
    }
}

impl<S, P> fmt::Debug for Transaction<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("dialect", &self.provider.dialect())
            .field("metrics", &self.counters.metrics())
            .finish()
    }
}
