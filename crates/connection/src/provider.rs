//! Connection provider abstraction
//!
//! Two providers exist: [`PoolProvider`](crate::PoolProvider) for many
//! concurrent sessions and [`SingleProvider`](crate::SingleProvider) for one
//! shared session. Both detect the server dialect once while being built
//! and tear down everything they opened if detection fails.

use crate::connection::Connection;
use crate::driver::PhysicalConnection;
use async_trait::async_trait;
use tessera_core::{Dialect, Result};
use tracing::{info, warn};

/// Source of [`Connection`]s
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Check out a connection; waits when none is available
    async fn get_connection(&self) -> Result<Connection>;

    /// Dialect detected at construction
    fn dialect(&self) -> Dialect;

    /// Stop issuing connections and close idle sessions
    ///
    /// One-shot: a second call is a programming error.
    async fn shutdown(&self) -> Result<()>;

    /// True once `shutdown()` was called
    fn is_shut_down(&self) -> bool;
}

/// Detect the dialect of a freshly opened session
///
/// On an unsupported server the session is destroyed before the error is
/// returned.
pub(crate) fn detect_dialect(physical: &mut Box<dyn PhysicalConnection>) -> Result<Dialect> {
    let version = physical.server_version().to_string();
    match Dialect::detect(&version) {
        Ok(dialect) => {
            info!(target: "tessera::pool", %version, %dialect, "Detected server dialect");
            Ok(dialect)
        }
        Err(e) => {
            warn!(target: "tessera::pool", %version, "Unsupported server version");
            physical.destroy();
            Err(e)
        }
    }
}
