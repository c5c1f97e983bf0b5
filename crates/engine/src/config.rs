//! Configuration via `tessera.toml`
//!
//! A missing file is replaced by a commented default on first open. Every
//! section and field is optional; omitted values take the defaults shown in
//! [`TesseraConfig::default_toml`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tessera_concurrency::{MonitorOptions, DEFAULT_VERSION_TABLE};
use tessera_connection::PoolOptions;
use tessera_core::{Error, Result};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Server endpoint and credentials, consumed by the driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// User name
    pub user: String,
    /// Password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Default schema
    pub database: String,
    /// Upper bound for establishing one session, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            database: "app".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Which connection provider to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    /// Bounded pool of sessions
    Pool,
    /// One shared session
    Single,
}

/// Connection provider settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// `"pool"` or `"single"`
    pub mode: String,
    /// Maximum checked-out connections (pool only)
    pub connection_limit: usize,
    /// Maximum waiting callers, 0 = unbounded (pool only)
    pub queue_limit: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let pool = PoolOptions::default();
        Self {
            mode: "pool".to_string(),
            connection_limit: pool.connection_limit,
            queue_limit: pool.queue_limit,
        }
    }
}

/// Where segment versions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStoreKind {
    /// Version table in the database
    Sql,
    /// Process memory
    Memory,
}

/// Segment monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// `"sql"` or `"memory"`
    pub store: String,
    /// Version table name (sql store only)
    pub table: String,
    /// Upper bound for acquiring all segment locks of a transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            store: "sql".to_string(),
            table: DEFAULT_VERSION_TABLE.to_string(),
            lock_timeout_ms: None,
        }
    }
}

/// Configuration loaded from `tessera.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TesseraConfig {
    /// `[connection]` section
    pub connection: ConnectionConfig,
    /// `[provider]` section
    pub provider: ProviderConfig,
    /// `[monitor]` section
    pub monitor: MonitorConfig,
}

impl TesseraConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera configuration

[connection]
host = "127.0.0.1"
port = 3306
user = "root"
# password = ""
database = "app"
# Upper bound for opening one session
connect_timeout_ms = 10000

[provider]
# "pool"   = bounded pool of sessions
# "single" = one shared session, callers served in arrival order
mode = "pool"
connection_limit = 10
# Callers allowed to wait for a connection (0 = unbounded)
queue_limit = 0

[monitor]
# "sql"    = versions stored in a table, committed with the transaction
# "memory" = versions kept in process memory
store = "sql"
table = "segment_versions"
# Upper bound for acquiring all segment locks of a transaction
# lock_timeout_ms = 5000
"#
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: TesseraConfig = toml::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content).map_err(|e| match e {
            Error::Config(msg) => Error::config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to `path`
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Check every value eagerly
    pub fn validate(&self) -> Result<()> {
        self.provider_mode()?;
        self.store_kind()?;
        if self.provider.connection_limit == 0 {
            return Err(Error::config("provider.connection_limit must be at least 1"));
        }
        if self.monitor.table.trim().is_empty() {
            return Err(Error::config("monitor.table must not be empty"));
        }
        Ok(())
    }

    /// Parsed `provider.mode`
    pub fn provider_mode(&self) -> Result<ProviderMode> {
        match self.provider.mode.as_str() {
            "pool" => Ok(ProviderMode::Pool),
            "single" => Ok(ProviderMode::Single),
            other => Err(Error::config(format!(
                "Invalid provider mode '{}'. Expected \"pool\" or \"single\".",
                other
            ))),
        }
    }

    /// Parsed `monitor.store`
    pub fn store_kind(&self) -> Result<VersionStoreKind> {
        match self.monitor.store.as_str() {
            "sql" => Ok(VersionStoreKind::Sql),
            "memory" => Ok(VersionStoreKind::Memory),
            other => Err(Error::config(format!(
                "Invalid version store '{}'. Expected \"sql\" or \"memory\".",
                other
            ))),
        }
    }

    /// Pool sizing from the `[provider]` section
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            connection_limit: self.provider.connection_limit,
            queue_limit: self.provider.queue_limit,
        }
    }

    /// Monitor options from the `[monitor]` section
    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            lock_timeout: self.monitor.lock_timeout_ms.map(Duration::from_millis),
        }
    }
}
