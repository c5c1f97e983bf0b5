//! Transaction engine for Tessera
//!
//! This crate orchestrates the lower layers:
//! - Step: Unit of work with declared read/write segments, composable with `then`
//! - Transaction: Begin, monitor, step, version save, commit or rollback
//! - Service container: Ordered startup and dependency-aware shutdown
//! - Config: `tessera.toml` loading and validation
//! - Database: Provider + monitor wired from a config
//!
//! The engine is the only component that knows about:
//! - Which transaction mode a step needs
//! - When segment versions are saved
//! - Which services shut down before which

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod database;
pub mod metrics;
pub mod service;
pub mod step;
pub mod transaction;

pub use config::{
    ConnectionConfig, MonitorConfig, ProviderConfig, ProviderMode, TesseraConfig,
    VersionStoreKind, CONFIG_FILE_NAME,
};
pub use context::TransactionContext;
pub use database::{Database, MONITOR_SERVICE, PROVIDER_SERVICE};
pub use metrics::{TransactionCounters, TransactionMetrics};
pub use service::{Service, ServiceContainer, ServiceContainerBuilder, ServiceRegistry};
pub use step::{step_fn, Step, StepFn, Then};
pub use transaction::Transaction;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Database: Send, Sync);
    assert_impl_all!(ServiceContainer: Send, Sync);
    assert_impl_all!(TransactionCounters: Send, Sync);
}
