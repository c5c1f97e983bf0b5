//! Database facade
//!
//! `Database` wires a driver and a `TesseraConfig` into running services:
//!
//! - `connection_provider`: a `PoolProvider` or `SingleProvider`
//! - `segment_monitor`: a `SegmentMonitor` with the configured version store;
//!   it shuts down before the provider it uses
//!
//! Transactions defined through [`Database::transaction`] share the
//! database's provider, monitor and metrics.

use crate::config::{ProviderMode, TesseraConfig, VersionStoreKind, CONFIG_FILE_NAME};
use crate::context::TransactionContext;
use crate::metrics::{TransactionCounters, TransactionMetrics};
use crate::service::{ServiceContainer, ServiceRegistry};
use crate::step::Step;
use crate::transaction::Transaction;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tessera_concurrency::{MemoryVersionStore, SegmentMonitor, SqlVersionStore, VersionStore};
use tessera_connection::{
    ConnectionProvider, Driver, PhysicalConnection, PoolProvider, SingleProvider,
};
use tessera_core::{Dialect, DriverError, Result};
use tracing::info;

/// Registry key of the connection provider
pub const PROVIDER_SERVICE: &str = "connection_provider";
/// Registry key of the segment monitor
pub const MONITOR_SERVICE: &str = "segment_monitor";

/// Bounds `connect()` of the wrapped driver
struct ConnectTimeout {
    inner: Arc<dyn Driver>,
    timeout: Duration,
}

#[async_trait]
impl Driver for ConnectTimeout {
    async fn connect(&self) -> std::result::Result<Box<dyn PhysicalConnection>, DriverError> {
        match tokio::time::timeout(self.timeout, self.inner.connect()).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::fatal(format!(
                "connect timed out after {}ms",
                self.timeout.as_millis()
            ))
            .with_code("ETIMEDOUT")),
        }
    }
}

/// Running provider, monitor and services
pub struct Database {
    config: TesseraConfig,
    services: ServiceContainer,
    provider: Arc<dyn ConnectionProvider>,
    monitor: Arc<SegmentMonitor>,
    counters: Arc<TransactionCounters>,
}

impl Database {
    /// Start the services described by `config` on top of `driver`
    ///
    /// # Errors
    /// - `Error::Config` if the config does not validate
    /// - Provider construction errors (connect failure, unsupported server);
    ///   anything opened so far is torn down first
    /// - Version table creation errors (sql store)
    pub async fn open(config: TesseraConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate()?;
        let mode = config.provider_mode()?;
        let store_kind = config.store_kind()?;
        let driver: Arc<dyn Driver> = Arc::new(ConnectTimeout {
            inner: driver,
            timeout: config.connection.connect_timeout(),
        });

        let builder = ServiceContainer::builder();
        let builder = match mode {
            ProviderMode::Pool => {
                let options = config.pool_options();
                builder.service(PROVIDER_SERVICE, &[], move |_| async move {
                    Ok(Arc::new(PoolProvider::connect(driver, options).await?))
                })
            }
            ProviderMode::Single => builder.service(PROVIDER_SERVICE, &[], move |_| async move {
                Ok(Arc::new(SingleProvider::connect(driver).await?))
            }),
        };

        let table = config.monitor.table.clone();
        let monitor_options = config.monitor_options();
        let services = builder
            .service(
                MONITOR_SERVICE,
                &[PROVIDER_SERVICE],
                move |registry: ServiceRegistry| async move {
                    let store: Arc<dyn VersionStore> = match store_kind {
                        VersionStoreKind::Memory => Arc::new(MemoryVersionStore::new()),
                        VersionStoreKind::Sql => {
                            let store = SqlVersionStore::new(table);
                            let provider = provider_from(&registry, mode)?;
                            let mut conn = provider.get_connection().await?;
                            store.ensure_schema(&mut conn).await?;
                            conn.release()?;
                            Arc::new(store)
                        }
                    };
                    Ok(Arc::new(SegmentMonitor::with_options(store, monitor_options)))
                },
            )
            .start()
            .await?;

        let provider = provider_from(services.registry(), mode)?;
        let monitor = services.get::<SegmentMonitor>(MONITOR_SERVICE)?;
        info!(
            target: "tessera::service",
            dialect = %provider.dialect(),
            provider = ?mode,
            store = ?store_kind,
            "Database ready"
        );
        Ok(Self {
            config,
            services,
            provider,
            monitor,
            counters: Arc::new(TransactionCounters::new()),
        })
    }

    /// Open using the config file in `dir`, creating a default one if missing
    pub async fn open_dir(dir: &Path, driver: Arc<dyn Driver>) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        TesseraConfig::write_default_if_missing(&path)?;
        let config = TesseraConfig::from_file(&path)?;
        Self::open(config, driver).await
    }

    /// Effective configuration
    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    /// Dialect of the connected server
    pub fn dialect(&self) -> Dialect {
        self.provider.dialect()
    }

    /// Connection provider
    pub fn provider(&self) -> Arc<dyn ConnectionProvider> {
        Arc::clone(&self.provider)
    }

    /// Segment monitor
    pub fn monitor(&self) -> Arc<SegmentMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Running services
    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    /// Define a transaction counted in this database's metrics
    pub fn transaction<S, P>(&self, name: impl Into<String>, step: S) -> Transaction<S, P>
    where
        P: Send + 'static,
        S: Step<TransactionContext<P>>,
    {
        Transaction::new(name, self.provider(), self.monitor(), step)
            .with_counters(Arc::clone(&self.counters))
    }

    /// Counters of all transactions defined through this database
    pub fn metrics(&self) -> TransactionMetrics {
        self.counters.metrics()
    }

    /// Shut all services down, monitor first
    pub async fn shutdown(&self) -> Result<()> {
        self.services.shutdown().await
    }
}

fn provider_from(
    registry: &ServiceRegistry,
    mode: ProviderMode,
) -> Result<Arc<dyn ConnectionProvider>> {
    Ok(match mode {
        ProviderMode::Pool => registry.get::<PoolProvider>(PROVIDER_SERVICE)? as Arc<dyn ConnectionProvider>,
        ProviderMode::Single => registry.get::<SingleProvider>(PROVIDER_SERVICE)?,
    })
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dialect", &self.dialect())
            .field("services", &self.services)
            .field("metrics", &self.metrics())
            .finish()
    }
}
