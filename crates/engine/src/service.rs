//! Service container
//!
//! Services are declared in order, each with a key, a factory, and the keys
//! of services that must not shut down before it:
//!
//! ```ignore
//! let container = ServiceContainer::builder()
//!     .service("provider", &[], |_| async move { Ok(Arc::new(pool)) })
//!     .service("monitor", &["provider"], |registry| async move {
//!         let provider = registry.get::<PoolProvider>("provider")?;
//!         Ok(Arc::new(SegmentMonitor::in_memory()))
//!     })
//!     .start()
//!     .await?;
//! ```
//!
//! `start()` runs the factories in declaration order; a factory sees every
//! service started before it. `shutdown()` walks the shutdown edges in
//! reverse topological order: a service is torn down only after every
//! service naming it in `shutdown_after` has finished. Ties go to the
//! service declared last.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_concurrency::SegmentMonitor;
use tessera_connection::{ConnectionProvider, PoolProvider, SingleProvider};
use tessera_core::{Error, Result};
use tracing::{debug, error, info};

/// A component with a graceful teardown
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Release the resources held by this service
    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
impl Service for PoolProvider {
    async fn shutdown(&self) -> Result<()> {
        ConnectionProvider::shutdown(self).await
    }
}

#[async_trait]
impl Service for SingleProvider {
    async fn shutdown(&self) -> Result<()> {
        ConnectionProvider::shutdown(self).await
    }
}

#[async_trait]
impl Service for SegmentMonitor {
    async fn shutdown(&self) -> Result<()> {
        SegmentMonitor::shutdown(self).await
    }
}

#[derive(Clone)]
struct Registered {
    any: Arc<dyn Any + Send + Sync>,
    service: Arc<dyn Service>,
}

/// Started services, looked up by key
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, Registered>>>,
}

impl ServiceRegistry {
    /// Service registered under `key`
    ///
    /// # Errors
    /// `Error::Service` if nothing is registered under `key` or it is not a `T`.
    pub fn get<T: Service>(&self, key: &str) -> Result<Arc<T>> {
        let registered = self
            .services
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::service(key, "not started"))?;
        registered
            .any
            .downcast::<T>()
            .map_err(|_| Error::service(key, format!("is not a {}", std::any::type_name::<T>())))
    }

    /// True if a service is registered under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.services.read().contains_key(key)
    }

    fn insert(&self, key: &str, registered: Registered) {
        self.services.write().insert(key.to_string(), registered);
    }

    fn service(&self, key: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .get(key)
            .map(|registered| Arc::clone(&registered.service))
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.services.read().keys().cloned().collect();
        keys.sort();
        f.debug_struct("ServiceRegistry").field("keys", &keys).finish()
    }
}

type Factory = Box<dyn FnOnce(ServiceRegistry) -> BoxFuture<'static, Result<Registered>> + Send>;

struct Declaration {
    key: String,
    shutdown_after: Vec<String>,
    factory: Factory,
}

/// Declares the services of a container
#[derive(Default)]
pub struct ServiceContainerBuilder {
    declarations: Vec<Declaration>,
}

impl ServiceContainerBuilder {
    /// Declare a service
    ///
    /// # Arguments
    /// * `key` - Unique service key
    /// * `shutdown_after` - Keys of services that must not shut down before this one
    /// * `factory` - Builds the service; receives the services started so far
    pub fn service<T, F, Fut>(mut self, key: &str, shutdown_after: &[&str], factory: F) -> Self
    where
        T: Service,
        F: FnOnce(ServiceRegistry) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<T>>> + Send + 'static,
    {
        let factory: Factory = Box::new(move |registry| {
            Box::pin(async move {
                let service = factory(registry).await?;
                Ok(Registered {
                    any: Arc::clone(&service) as Arc<dyn Any + Send + Sync>,
                    service: service as Arc<dyn Service>,
                })
            })
        });
        self.declarations.push(Declaration {
            key: key.to_string(),
            shutdown_after: shutdown_after.iter().map(|k| k.to_string()).collect(),
            factory,
        });
        self
    }

    /// Validate the declarations and start every service in order
    ///
    /// # Errors
    /// - `Error::Config` for a duplicate key, an unknown key in a shutdown
    ///   edge, or a cycle among the edges; nothing is started
    /// - The first factory error; services started before it are shut down
    pub async fn start(self) -> Result<ServiceContainer> {
        let keys: Vec<String> = self.declarations.iter().map(|d| d.key.clone()).collect();
        let edges: Vec<Vec<String>> = self
            .declarations
            .iter()
            .map(|d| d.shutdown_after.clone())
            .collect();
        let shutdown_order = shutdown_order(&keys, &edges)?;

        let registry = ServiceRegistry::default();
        let mut container = ServiceContainer {
            registry: registry.clone(),
            started: HashSet::new(),
            shutdown_order,
            shut_down: AtomicBool::new(false),
        };

        for declaration in self.declarations {
            match (declaration.factory)(registry.clone()).await {
                Ok(registered) => {
                    registry.insert(&declaration.key, registered);
                    container.started.insert(declaration.key.clone());
                    info!(target: "tessera::service", key = %declaration.key, "Service started");
                }
                Err(e) => {
                    error!(target: "tessera::service", key = %declaration.key, error = %e, "Service failed to start");
                    container.shutdown_started().await;
                    return Err(e);
                }
            }
        }
        Ok(container)
    }
}

/// Order in which services shut down
///
/// `edges[i]` lists the keys that must not shut down before `keys[i]`.
fn shutdown_order(keys: &[String], edges: &[Vec<String>]) -> Result<Vec<String>> {
    let mut index = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        if index.insert(key.as_str(), i).is_some() {
            return Err(Error::config(format!("service '{}' declared twice", key)));
        }
    }

    // dependents[j] counts services that must shut down before keys[j]
    let mut dependents = vec![0usize; keys.len()];
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];
    for (i, after) in edges.iter().enumerate() {
        for key in after {
            let j = *index.get(key.as_str()).ok_or_else(|| {
                Error::config(format!(
                    "service '{}' lists unknown service '{}' in shutdown_after",
                    keys[i], key
                ))
            })?;
            if !dependencies[i].contains(&j) {
                dependencies[i].push(j);
                dependents[j] += 1;
            }
        }
    }

    let mut done = vec![false; keys.len()];
    let mut order = Vec::with_capacity(keys.len());
    while order.len() < keys.len() {
        let next = (0..keys.len())
            .rev()
            .find(|&i| !done[i] && dependents[i] == 0)
            .ok_or_else(|| {
                let stuck: Vec<&str> = (0..keys.len())
                    .filter(|&i| !done[i])
                    .map(|i| keys[i].as_str())
                    .collect();
                Error::config(format!(
                    "shutdown dependencies form a cycle among {:?}",
                    stuck
                ))
            })?;
        done[next] = true;
        for &j in &dependencies[next] {
            dependents[j] -= 1;
        }
        order.push(keys[next].clone());
    }
    Ok(order)
}

/// Running set of services
pub struct ServiceContainer {
    registry: ServiceRegistry,
    started: HashSet<String>,
    shutdown_order: Vec<String>,
    shut_down: AtomicBool,
}

impl ServiceContainer {
    /// Start declaring services
    pub fn builder() -> ServiceContainerBuilder {
        ServiceContainerBuilder::default()
    }

    /// Lookup of the started services
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Service registered under `key`
    pub fn get<T: Service>(&self, key: &str) -> Result<Arc<T>> {
        self.registry.get(key)
    }

    /// Keys in the order `shutdown()` tears them down
    pub fn shutdown_order(&self) -> &[String] {
        &self.shutdown_order
    }

    /// True once `shutdown()` was called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Shut every service down in dependency order
    ///
    /// Errors of individual services are logged and do not stop the walk.
    ///
    /// # Errors
    /// `Error::Programming` on a second call.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Err(Error::programming("service container already shut down"));
        }
        self.shutdown_started().await;
        info!(target: "tessera::service", "All services shut down");
        Ok(())
    }

    async fn shutdown_started(&self) {
        for key in &self.shutdown_order {
            if !self.started.contains(key) {
                continue;
            }
            let Some(service) = self.registry.service(key) else {
                continue;
            };
            debug!(target: "tessera::service", key = %key, "Shutting down service");
            match service.shutdown().await {
                Ok(()) => info!(target: "tessera::service", key = %key, "Service shut down"),
                Err(e) => {
                    error!(target: "tessera::service", key = %key, error = %e, "Service shutdown failed")
                }
            }
        }
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("registry", &self.registry)
            .field("shutdown_order", &self.shutdown_order)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
