//! Blocking connection façade.
//!
//! [`SyncConnection`] turns the callback-driven [`Transport`] into plain
//! blocking calls. Each operation installs itself as the single pending wait,
//! fires the async request, and parks the calling thread until either its own
//! callback or the disconnect monitor resolves the wait.
//!
//! # Example
//!
//! ```no_run
//! use crab_sync::{ConnectOptions, MemoryService, SyncConnection};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = MemoryService::new()?;
//! service.method("add", |args| {
//!     let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!     Ok(json!(sum))
//! });
//!
//! let conn = SyncConnection::connect(&service, "memory://local", ConnectOptions::new())?;
//! assert_eq!(conn.call("add", &[json!(1), json!(2)])?, json!(3));
//! conn.close();
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{ConnectOptions, TransportOptions};
use crate::error::{RemoteError, SyncError, SyncResult, TransportError};
use crate::monitor::{Monitor, WaitKind};
use crate::transport::{
    ConnectRequest, Connection, ConnectionEvents, SubscribeCallbacks, Subscription, Transport,
};

/// Synchronous wrapper around one transport session
///
/// Only one blocking operation may be outstanding at a time. Sharing a
/// `SyncConnection` between threads is allowed, but a second operation
/// started while one is pending fails with
/// [`InvariantViolation::OperationPending`](crate::InvariantViolation::OperationPending).
#[derive(Debug)]
pub struct SyncConnection {
    monitor: Arc<Monitor>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl SyncConnection {
    /// Open one session to `endpoint` and block until it is established.
    ///
    /// Retry is forced off and the connect timeout is forced to
    /// [`CONNECT_TIMEOUT`](crate::config::CONNECT_TIMEOUT), whatever `options` says.
    pub fn connect(
        registry: &dyn Transport,
        endpoint: &str,
        options: ConnectOptions,
    ) -> SyncResult<Self> {
        let options = TransportOptions::from_connect_options(&options);
        let suppress_errors = options.suppress_errors;
        let monitor = Arc::new(Monitor::new(endpoint));

        let (wait_id, slot) = monitor.begin(WaitKind::Connect)?;

        let on_connected = {
            let monitor = monitor.clone();
            Box::new(move || monitor.on_connected(wait_id))
        };
        let on_disconnect = {
            let monitor = monitor.clone();
            Arc::new(move |error: Option<TransportError>| monitor.on_disconnect(error))
        };
        let events = ConnectionEvents {
            on_connected,
            on_disconnect,
        };

        tracing::info!("Connecting to {}", endpoint);
        let request = ConnectRequest {
            endpoint: endpoint.to_string(),
            options,
        };
        let connection = match registry.connect(request, events) {
            Ok(connection) => connection,
            Err(e) => {
                monitor.cancel(wait_id);
                if !suppress_errors {
                    tracing::warn!("Failed to connect to {}: {}", endpoint, e);
                }
                return Err(SyncError::Transport(e));
            }
        };

        let facade = Self {
            monitor,
            connection: Mutex::new(Some(connection)),
        };

        match slot.wait() {
            Ok(_) => Ok(facade),
            Err(e) => {
                if suppress_errors {
                    tracing::debug!("Failed to connect to {}: {}", endpoint, e);
                } else {
                    tracing::warn!("Failed to connect to {}: {}", endpoint, e);
                }
                facade.close();
                Err(e)
            }
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Arc<dyn Connection>>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self) -> SyncResult<Arc<dyn Connection>> {
        self.lock_connection().clone().ok_or(SyncError::Closed)
    }

    /// Invoke `name` with positional `args` and block for its result.
    ///
    /// Returns the remote result, [`SyncError::Remote`] when the method fails,
    /// or a disconnect error if the session drops first.
    pub fn apply(&self, name: &str, args: Vec<Value>) -> SyncResult<Value> {
        let connection = self.handle()?;
        let (wait_id, slot) = self.monitor.begin(WaitKind::Call {
            method: name.to_string(),
        })?;

        let monitor = self.monitor.clone();
        connection.apply(
            name,
            args,
            Box::new(move |result: Result<Value, RemoteError>| monitor.on_result(wait_id, result)),
        );

        slot.wait()
    }

    /// Same as [`apply`](Self::apply) with the arguments given as a slice
    pub fn call(&self, name: &str, args: &[Value]) -> SyncResult<Value> {
        self.apply(name, args.to_vec())
    }

    /// Start a subscription and block until it is ready.
    ///
    /// An error reported before readiness is returned here. One reported
    /// afterwards has no caller left and is raised back to the transport.
    pub fn subscribe_and_wait(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> SyncResult<SubscriptionHandle> {
        let connection = self.handle()?;
        let (wait_id, slot) = self.monitor.begin(WaitKind::Subscribe {
            name: name.to_string(),
        })?;

        let on_ready = {
            let monitor = self.monitor.clone();
            Box::new(move || monitor.on_ready(wait_id))
        };
        let on_error = {
            let monitor = self.monitor.clone();
            Box::new(move |error: RemoteError| monitor.on_subscription_error(wait_id, error))
        };
        let callbacks = SubscribeCallbacks { on_ready, on_error };
        let subscription = connection.subscribe(name, args, callbacks);

        if let Err(e) = slot.wait() {
            tracing::debug!("Subscription {} ({}) failed: {}", name, subscription.id(), e);
            subscription.stop();
            return Err(e);
        }
        tracing::debug!("Subscription {} ({}) ready", name, subscription.id());
        Ok(SubscriptionHandle {
            name: name.to_string(),
            inner: subscription,
        })
    }

    /// Close the underlying session. Calling it again does nothing.
    ///
    /// Pending waits are not touched here; the disconnect the transport
    /// reports afterwards goes through the usual monitor path.
    pub fn close(&self) {
        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            tracing::info!("Closing connection to {}", self.monitor.endpoint());
            connection.close();
        }
    }

    /// Last known transport state
    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }

    /// True while a blocking operation is outstanding
    pub fn is_busy(&self) -> bool {
        self.monitor.is_busy()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_connection().is_none()
    }

    pub fn endpoint(&self) -> &str {
        self.monitor.endpoint()
    }
}

impl Drop for SyncConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A ready subscription returned by [`SyncConnection::subscribe_and_wait`]
#[derive(Debug)]
pub struct SubscriptionHandle {
    name: String,
    inner: Box<dyn Subscription>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        tracing::debug!("Stopping subscription {} ({})", self.name, self.inner.id());
        self.inner.stop();
    }
}
