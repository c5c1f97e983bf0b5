//! Single shared session provider
//!
//! Exactly one physical session, opened at construction, is handed out to
//! one caller at a time. Callers arriving while it is checked out wait in an
//! explicit FIFO queue. On release the session is passed directly to the
//! oldest waiter that is still interested, so allocation order always
//! matches arrival order and no newcomer can overtake the queue.
//!
//! A fatal error on the session is terminal for the provider: the session
//! is destroyed, every waiter is rejected, and later requests fail with the
//! recorded error.

use crate::connection::Connection;
use crate::driver::{Driver, PhysicalConnection};
use crate::provider::{detect_dialect, ConnectionProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_core::{Dialect, DriverError, Error, Result};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Handoff = Result<Box<dyn PhysicalConnection>>;

struct SingleState {
    /// The session while it is idle in the provider
    physical: Option<Box<dyn PhysicalConnection>>,
    checked_out: bool,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
    fatal: Option<DriverError>,
    shut_down: bool,
}

struct SingleShared {
    dialect: Dialect,
    state: Mutex<SingleState>,
}

impl SingleShared {
    fn reclaim(&self, mut physical: Box<dyn PhysicalConnection>, fatal: Option<DriverError>) {
        let mut state = self.state.lock();

        if let Some(fatal) = fatal {
            warn!(target: "tessera::pool", thread_id = physical.thread_id(), error = %fatal, "Single connection failed fatally");
            physical.destroy();
            state.checked_out = false;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(Error::Driver(fatal.clone())));
            }
            state.fatal = Some(fatal);
            return;
        }

        if state.shut_down {
            debug!(target: "tessera::pool", thread_id = physical.thread_id(), "Destroying single connection released after shutdown");
            physical.destroy();
            state.checked_out = false;
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Ok(physical)) {
                Ok(()) => return,
                Err(Ok(returned)) => physical = returned,
                Err(Err(_)) => return,
            }
        }
        state.checked_out = false;
        state.physical = Some(physical);
    }
}

/// Pending checkout; gives the session back if the caller stops waiting
/// after it was already handed over.
struct Waiter {
    rx: oneshot::Receiver<Handoff>,
    shared: Arc<SingleShared>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(physical)) = self.rx.try_recv() {
            self.shared.reclaim(physical, None);
        }
    }
}

/// Provider serializing all callers on one physical session
pub struct SingleProvider {
    shared: Arc<SingleShared>,
}

impl SingleProvider {
    /// Open the session and detect the server dialect
    ///
    /// # Errors
    /// - Driver error if the session cannot be opened
    /// - `Error::UnsupportedServer`; the session is destroyed first
    pub async fn connect(driver: Arc<dyn Driver>) -> Result<Self> {
        let mut physical = driver.connect().await?;
        let dialect = detect_dialect(&mut physical)?;
        info!(target: "tessera::pool", thread_id = physical.thread_id(), %dialect, "Single connection ready");

        Ok(Self {
            shared: Arc::new(SingleShared {
                dialect,
                state: Mutex::new(SingleState {
                    physical: Some(physical),
                    checked_out: false,
                    waiters: VecDeque::new(),
                    fatal: None,
                    shut_down: false,
                }),
            }),
        })
    }

    /// Number of callers waiting for the session
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// True while the session is checked out
    pub fn is_checked_out(&self) -> bool {
        self.shared.state.lock().checked_out
    }

    /// Fatal error that ended the session, if any
    pub fn fatal_error(&self) -> Option<DriverError> {
        self.shared.state.lock().fatal.clone()
    }

    fn wrap(&self, physical: Box<dyn PhysicalConnection>) -> Connection {
        let shared = Arc::clone(&self.shared);
        Connection::new(
            physical,
            self.shared.dialect,
            Box::new(move |physical, fatal| shared.reclaim(physical, fatal)),
        )
    }
}

#[async_trait]
impl ConnectionProvider for SingleProvider {
    async fn get_connection(&self) -> Result<Connection> {
        let mut waiter = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(Error::shutdown("single connection provider"));
            }
            if let Some(fatal) = &state.fatal {
                return Err(Error::Driver(fatal.clone()));
            }
            if !state.checked_out {
                if let Some(physical) = state.physical.take() {
                    state.checked_out = true;
                    drop(state);
                    return Ok(self.wrap(physical));
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(target: "tessera::pool", position = state.waiters.len(), "Waiting for single connection");
            Waiter {
                rx,
                shared: Arc::clone(&self.shared),
            }
        };

        match (&mut waiter.rx).await {
            Ok(Ok(physical)) => Ok(self.wrap(physical)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::shutdown("single connection provider")),
        }
    }

    fn dialect(&self) -> Dialect {
        self.shared.dialect
    }

    async fn shutdown(&self) -> Result<()> {
        let physical = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(Error::programming("single connection provider already shut down"));
            }
            state.shut_down = true;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(Error::shutdown("single connection provider")));
            }
            if state.fatal.is_some() {
                info!(target: "tessera::pool", "Single connection provider shut down (connection already destroyed)");
                return Ok(());
            }
            state.physical.take()
        };

        if let Some(mut physical) = physical {
            if let Err(e) = physical.end().await {
                physical.destroy();
                return Err(Error::Driver(e));
            }
        }
        info!(target: "tessera::pool", "Single connection provider shut down");
        Ok(())
    }

    fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shut_down
    }
}
