//! Error types for Tessera
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors are `Clone` because a connection that observed a fatal driver error
//! keeps it and hands the same error back to every later caller.

use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error reported by the database driver
///
/// `fatal` mirrors the driver's own classification: a fatal error means the
/// physical session can no longer be trusted and must be destroyed rather
/// than reused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{message}{}", code_prefix(.code), fatal_suffix(.fatal))]
pub struct DriverError {
    /// Server or client error code (e.g. `ER_LOCK_DEADLOCK`), if any
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Whether the physical session is unusable after this error
    pub fatal: bool,
}

impl DriverError {
    /// Create a recoverable driver error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            fatal: false,
        }
    }

    /// Create a fatal driver error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            fatal: true,
        }
    }

    /// Attach an error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Return a copy of this error flagged as fatal
    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

fn code_prefix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!("{}: ", c)).unwrap_or_default()
}

fn fatal_suffix(fatal: &bool) -> &'static str {
    if *fatal {
        " (fatal)"
    } else {
        ""
    }
}

/// Error types for Tessera
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Precondition violation by the caller (wrong state, double release, ...)
    ///
    /// Never retried; indicates a bug in the calling code.
    #[error("Programming error: {0}")]
    Programming(String),

    /// Error reported by the database driver
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Operation rejected because the component was shut down
    #[error("{0} has been shut down")]
    Shutdown(String),

    /// Pool wait queue is full
    #[error("Connection queue limit reached ({limit} waiting)")]
    QueueLimit {
        /// Configured queue limit
        limit: usize,
    },

    /// Server version did not match a supported dialect
    #[error("Unsupported database server version '{version}'")]
    UnsupportedServer {
        /// Version string reported by the server
        version: String,
    },

    /// Waiting for a segment lock exceeded the configured timeout
    #[error("Timed out after {waited_ms}ms waiting for lock on segment '{segment}'")]
    LockTimeout {
        /// Segment whose lock could not be acquired
        segment: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Segment version load or save failed
    #[error("Version store error: {0}")]
    VersionStore(String),

    /// Application step logic failed
    #[error("Step failed: {0}")]
    Step(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A service failed to start or stop
    #[error("Service '{key}' failed: {message}")]
    Service {
        /// Registration key of the service
        key: String,
        /// Failure description
        message: String,
    },
}

impl Error {
    /// Create a programming error
    pub fn programming(msg: impl Into<String>) -> Self {
        Error::Programming(msg.into())
    }

    /// Create a shutdown error naming the rejecting component
    pub fn shutdown(what: impl Into<String>) -> Self {
        Error::Shutdown(what.into())
    }

    /// Create a step error
    pub fn step(msg: impl Into<String>) -> Self {
        Error::Step(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a version store error
    pub fn version_store(msg: impl Into<String>) -> Self {
        Error::VersionStore(msg.into())
    }

    /// Create a service error
    pub fn service(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Service {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// True for precondition violations
    pub fn is_programming(&self) -> bool {
        matches!(self, Error::Programming(_))
    }

    /// True when the error carries a fatal driver error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Driver(e) if e.fatal)
    }

    /// The underlying driver error, if any
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Error::Driver(e) => Some(e),
            _ => None,
        }
    }
}
