//! Connection layer for Tessera
//!
//! This crate turns a black-box driver into transaction-aware connections:
//! - Driver / PhysicalConnection: Capability consumed from the wire driver
//! - Connection: Transaction status state machine with sticky fatal errors
//! - PoolProvider: Bounded pool of concurrent sessions
//! - SingleProvider: One shared session with a FIFO wait queue
//! - mock: Scripted driver for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod driver;
pub mod mock;
pub mod pool;
pub mod provider;
pub mod single;

pub use connection::{Connection, Releaser, TxStatus};
pub use driver::{Driver, PhysicalConnection};
pub use pool::{PoolOptions, PoolProvider, PoolStats};
pub use provider::ConnectionProvider;
pub use single::SingleProvider;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Connection: Send);
    assert_impl_all!(PoolProvider: Send, Sync);
    assert_impl_all!(SingleProvider: Send, Sync);
}
