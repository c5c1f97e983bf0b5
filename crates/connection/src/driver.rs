//! Driver capability consumed by the connection layer
//!
//! The MySQL wire protocol is not implemented here. A driver only has to
//! open sessions, run SQL, report server metadata, and classify its errors
//! as fatal or recoverable through [`DriverError::fatal`].

use async_trait::async_trait;
use tessera_core::{DriverError, QueryResult};

/// Factory for physical database sessions
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Open and authenticate a new physical session
    async fn connect(&self) -> Result<Box<dyn PhysicalConnection>, DriverError>;
}

/// One physical database session
///
/// A session processes one request at a time; callers never issue a second
/// query before the previous one resolved.
#[async_trait]
pub trait PhysicalConnection: Send + 'static {
    /// Server-assigned session id (MySQL `CONNECTION_ID()`)
    fn thread_id(&self) -> u64;

    /// Version string reported in the server handshake
    fn server_version(&self) -> &str;

    /// Execute one SQL statement or query
    async fn query(&mut self, sql: &str) -> Result<QueryResult, DriverError>;

    /// Gracefully close the session (`COM_QUIT`)
    async fn end(&mut self) -> Result<(), DriverError>;

    /// Close the socket immediately without any protocol exchange
    fn destroy(&mut self);
}
