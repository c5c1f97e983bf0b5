//! Tessera - Transaction layer for MySQL-family servers
//!
//! Tessera runs application transactions as chains of steps that declare the
//! segments they read and write. Before the first step runs, every declared
//! segment is locked in a fixed order and its version loaded; on commit the
//! written segments get a new version in the same database transaction.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{step_fn, Database, Segment, TesseraConfig, TransactionContext};
//!
//! let db = Database::open(TesseraConfig::default(), driver).await?;
//!
//! let rename = db.transaction(
//!     "rename-customer",
//!     step_fn(vec![], vec![Segment::keyed("customers", "42")], |conn, monitor, ctx: TransactionContext<String>| {
//!         Box::pin(async move {
//!             let sql = format!("UPDATE customers SET name = {} WHERE id = 42", conn.dialect().string_literal(ctx.params()));
//!             conn.execute_statement(&sql).await?;
//!             monitor.add_segment_update(&Segment::keyed("customers", "42"))
//!         })
//!     }),
//! );
//! rename.execute("Alice".to_string()).await?;
//! db.shutdown().await?;
//! ```
//!
//! # Architecture
//!
//! - `tessera-core`: errors, segments, values, dialects
//! - `tessera-connection`: driver capability, connection state machine, providers
//! - `tessera-concurrency`: segment locks, version stores, monitors
//! - `tessera-engine`: steps, transactions, service container, config

pub use tessera_concurrency::{
    LockMode, MemoryVersionStore, MonitorOptions, SegmentMonitor, SqlVersionStore,
    TransactionMonitor, VersionStore,
};
pub use tessera_connection::{
    Connection, ConnectionProvider, Driver, PhysicalConnection, PoolOptions, PoolProvider,
    SingleProvider, TxStatus,
};
pub use tessera_core::{
    Dialect, DriverError, EndTransaction, Error, QueryResult, Result, Row, Segment, SegmentId,
    SegmentStamp, SqlValue, TransactionMode,
};
pub use tessera_engine::{
    step_fn, Database, Service, ServiceContainer, Step, TesseraConfig, Transaction,
    TransactionContext, TransactionMetrics,
};

/// Scripted driver for tests and examples
pub use tessera_connection::mock;
