//! Connection wrapper and transaction status state machine
//!
//! A `Connection` owns one physical session while it is checked out of a
//! provider. Its transaction status only changes through
//! [`Connection::transition`], which rejects every edge not listed below.
//!
//! ```text
//!   Idle ──begin──▶ BeginPending ──ok──▶ Active ──commit──▶ CommitPending ──ok──▶ Idle
//!                        │                 │  │                   │
//!                        └──err──▶ Idle    │  └──fatal query──▶ Idle
//!                                          │                      └──err──▶ RollbackPending
//!                                          └──rollback──▶ RollbackPending ──always──▶ Idle
//! ```
//!
//! While a `START TRANSACTION`, `COMMIT` or `ROLLBACK` is outstanding on the
//! wire no other statement may be issued, otherwise request/response framing
//! on the single socket would desynchronize.
//!
//! A fatal driver error is sticky: every later operation except `release()`
//! fails with the stored error, and the provider destroys the physical
//! session instead of reusing it.

use crate::driver::PhysicalConnection;
use std::fmt;
use tessera_core::{
    Dialect, DriverError, EndTransaction, Error, QueryResult, Result, Row, TransactionMode,
};
use tracing::{debug, warn};

/// Callback returning a physical session to the provider it came from
///
/// Receives the fatal error recorded on the connection, if any; a provider
/// destroys the session in that case.
pub type Releaser = Box<dyn FnOnce(Box<dyn PhysicalConnection>, Option<DriverError>) + Send>;

/// Transaction status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxStatus {
    /// No transaction open
    Idle = 0,
    /// `START TRANSACTION` sent, response outstanding
    BeginPending = 1,
    /// `COMMIT` sent, response outstanding
    CommitPending = 2,
    /// Rollback required or `ROLLBACK` outstanding
    RollbackPending = 3,
    /// Transaction open, statements allowed
    Active = 4,
}

impl TxStatus {
    /// Numeric code of this status
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True while a transaction control statement is in flight
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            TxStatus::BeginPending | TxStatus::CommitPending | TxStatus::RollbackPending
        )
    }

    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition_to(self, to: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, to),
            (Idle, BeginPending)
                | (BeginPending, Active)
                | (BeginPending, Idle)
                | (Active, CommitPending)
                | (Active, RollbackPending)
                | (Active, Idle)
                | (CommitPending, Idle)
                | (CommitPending, RollbackPending)
                | (RollbackPending, Idle)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::Idle => "idle",
            TxStatus::BeginPending => "begin-pending",
            TxStatus::CommitPending => "commit-pending",
            TxStatus::RollbackPending => "rollback-pending",
            TxStatus::Active => "active",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// A checked-out database session
pub struct Connection {
    session_id: String,
    dialect: Dialect,
    status: TxStatus,
    fatal: Option<DriverError>,
    physical: Option<Box<dyn PhysicalConnection>>,
    releaser: Option<Releaser>,
}

impl Connection {
    /// Wrap a physical session handed out by a provider
    ///
    /// # Arguments
    /// * `physical` - Open session, exclusively owned from now on
    /// * `dialect` - Dialect detected by the provider
    /// * `releaser` - Called exactly once with the session on release
    pub fn new(physical: Box<dyn PhysicalConnection>, dialect: Dialect, releaser: Releaser) -> Self {
        let session_id = format!("conn-{}", physical.thread_id());
        Self {
            session_id,
            dialect,
            status: TxStatus::Idle,
            fatal: None,
            physical: Some(physical),
            releaser: Some(releaser),
        }
    }

    /// Session identifier, stable for the life of the physical link
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Dialect of the server behind this session
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Current transaction status
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// True when a transaction is open and statements may run in it
    pub fn in_transaction(&self) -> bool {
        self.status == TxStatus::Active
    }

    /// Sticky fatal error, if one was recorded
    pub fn fatal_error(&self) -> Option<&DriverError> {
        self.fatal.as_ref()
    }

    /// True once a fatal error was recorded
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// True once `release()` succeeded
    pub fn is_released(&self) -> bool {
        self.physical.is_none()
    }

    /// Apply one state machine edge
    fn transition(&mut self, to: TxStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(Error::programming(format!(
                "illegal transaction status transition {} -> {} on {}",
                self.status, to, self.session_id
            )));
        }
        self.status = to;
        Ok(())
    }

    fn check_fatal(&self) -> Result<()> {
        match &self.fatal {
            Some(fatal) => Err(Error::Driver(fatal.clone())),
            None => Ok(()),
        }
    }

    fn check_attached(&self) -> Result<()> {
        if self.physical.is_none() {
            return Err(Error::programming(format!(
                "connection {} used after release",
                self.session_id
            )));
        }
        Ok(())
    }

    fn record_fatal(&mut self, error: DriverError) -> DriverError {
        let error = error.into_fatal();
        self.fatal = Some(error.clone());
        error
    }

    async fn send(&mut self, sql: &str) -> std::result::Result<QueryResult, DriverError> {
        match self.physical.as_mut() {
            Some(physical) => physical.query(sql).await,
            None => Err(DriverError::fatal("physical session detached")),
        }
    }

    /// Open a transaction
    ///
    /// # Errors
    /// - The stored fatal error, if any
    /// - `Error::Programming` unless the status is `Idle`
    /// - The driver error if `START TRANSACTION` failed; the status is back
    ///   to `Idle` and, when the driver flagged it fatal, the error sticks
    pub async fn begin_transaction(&mut self, mode: TransactionMode) -> Result<()> {
        self.check_attached()?;
        self.check_fatal()?;
        if self.status != TxStatus::Idle {
            return Err(Error::programming(format!(
                "cannot begin a transaction on {} in status {}",
                self.session_id, self.status
            )));
        }

        self.transition(TxStatus::BeginPending)?;
        let sql = self.dialect.start_transaction(mode);
        match self.send(sql).await {
            Ok(_) => {
                self.transition(TxStatus::Active)?;
                debug!(target: "tessera::conn", session = %self.session_id, %mode, "Transaction started");
                Ok(())
            }
            Err(e) => {
                self.transition(TxStatus::Idle)?;
                let e = if e.fatal { self.record_fatal(e) } else { e };
                debug!(target: "tessera::conn", session = %self.session_id, error = %e, "Begin transaction failed");
                Err(Error::Driver(e))
            }
        }
    }

    /// Commit or roll back the open transaction
    ///
    /// A failed `COMMIT` leaves the connection in `RollbackPending` with a
    /// fatal error recorded, since the outcome on the server is unknown.
    /// `ROLLBACK` always ends in `Idle`; a failed rollback records a fatal
    /// error. Rolling back after a fatal error skips the wire entirely: the
    /// session is destroyed on release, which discards the server-side
    /// transaction.
    pub async fn end_transaction(&mut self, end: EndTransaction) -> Result<()> {
        self.check_attached()?;
        match end {
            EndTransaction::Commit => self.commit().await,
            EndTransaction::Rollback => self.rollback().await,
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_fatal()?;
        if self.status != TxStatus::Active {
            return Err(Error::programming(format!(
                "cannot commit on {} in status {}",
                self.session_id, self.status
            )));
        }

        self.transition(TxStatus::CommitPending)?;
        match self.send("COMMIT").await {
            Ok(_) => {
                self.transition(TxStatus::Idle)?;
                debug!(target: "tessera::conn", session = %self.session_id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                let e = self.record_fatal(e);
                self.transition(TxStatus::RollbackPending)?;
                debug!(target: "tessera::conn", session = %self.session_id, error = %e, "Commit failed");
                Err(Error::Driver(e))
            }
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        if !matches!(self.status, TxStatus::Active | TxStatus::RollbackPending) {
            if let Some(fatal) = &self.fatal {
                return Err(Error::Driver(fatal.clone()));
            }
            return Err(Error::programming(format!(
                "cannot roll back on {} in status {}",
                self.session_id, self.status
            )));
        }

        if let Some(fatal) = self.fatal.clone() {
            if self.status == TxStatus::Active {
                self.transition(TxStatus::RollbackPending)?;
            }
            self.transition(TxStatus::Idle)?;
            debug!(target: "tessera::conn", session = %self.session_id, "Rollback skipped on fatal connection");
            return Err(Error::Driver(fatal));
        }

        self.transition(TxStatus::RollbackPending)?;
        let result = self.send("ROLLBACK").await;
        self.transition(TxStatus::Idle)?;
        match result {
            Ok(_) => {
                debug!(target: "tessera::conn", session = %self.session_id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                let e = self.record_fatal(e);
                debug!(target: "tessera::conn", session = %self.session_id, error = %e, "Rollback failed");
                Err(Error::Driver(e))
            }
        }
    }

    async fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.check_attached()?;
        self.check_fatal()?;
        if self.status.is_pending() {
            return Err(Error::programming(format!(
                "cannot execute SQL on {} while status is {}",
                self.session_id, self.status
            )));
        }

        match self.send(sql).await {
            Ok(result) => Ok(result),
            Err(e) if e.fatal => {
                let e = self.record_fatal(e);
                self.transition(TxStatus::Idle)?;
                debug!(target: "tessera::conn", session = %self.session_id, error = %e, "Fatal error during statement");
                Err(Error::Driver(e))
            }
            Err(e) => Err(Error::Driver(e)),
        }
    }

    /// Execute a statement (DML/DDL) and return its counters
    pub async fn execute_statement(&mut self, sql: &str) -> Result<QueryResult> {
        self.run(sql).await
    }

    /// Execute a query and return its rows
    pub async fn execute_query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.run(sql).await.map(|result| result.rows)
    }

    /// Hand the physical session back to its provider
    ///
    /// # Errors
    /// - `Error::Programming` when called twice
    /// - `Error::Programming` while a transaction is open on a healthy
    ///   connection; the connection stays checked out
    pub fn release(&mut self) -> Result<()> {
        if self.physical.is_none() {
            return Err(Error::programming(format!(
                "connection {} released twice",
                self.session_id
            )));
        }
        if self.status != TxStatus::Idle && self.fatal.is_none() {
            return Err(Error::programming(format!(
                "cannot release {} with status {}",
                self.session_id, self.status
            )));
        }

        if let (Some(physical), Some(releaser)) = (self.physical.take(), self.releaser.take()) {
            debug!(target: "tessera::conn", session = %self.session_id, fatal = self.fatal.is_some(), "Connection released");
            releaser(physical, self.fatal.clone());
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("dialect", &self.dialect)
            .field("status", &self.status)
            .field("fatal", &self.fatal)
            .field("released", &self.physical.is_none())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let (Some(physical), Some(releaser)) = (self.physical.take(), self.releaser.take()) else {
            return;
        };
        let fatal = match (&self.fatal, self.status) {
            (Some(fatal), _) => Some(fatal.clone()),
            (None, TxStatus::Idle) => None,
            (None, status) => {
                warn!(target: "tessera::conn", session = %self.session_id, %status, "Connection dropped with an open transaction; destroying session");
                Some(DriverError::fatal(format!(
                    "connection dropped in status {}",
                    status
                )))
            }
        };
        releaser(physical, fatal);
    }
}
