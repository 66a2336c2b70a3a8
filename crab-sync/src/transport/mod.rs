// crab-sync/src/transport/mod.rs
// Callback-driven transport interface consumed by the blocking façade

use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::config::TransportOptions;
use crate::error::{RemoteError, SyncError, TransportError};

pub mod memory;

pub use memory::{Handshake, MemoryService};

/// What a callback hands back to the transport that invoked it.
///
/// `Err` means the callback raised: the transport must surface it to the
/// surrounding process (log it, record it, abort), never drop it.
pub type CallbackResult = Result<(), SyncError>;

/// Fired once when the session handshake succeeds
pub type ConnectedCallback = Box<dyn FnOnce() -> CallbackResult + Send>;

/// Fired on every disconnect for the lifetime of the connection
pub type DisconnectCallback = Arc<dyn Fn(Option<TransportError>) -> CallbackResult + Send + Sync>;

/// Fired once with the outcome of a method call
pub type ResultCallback = Box<dyn FnOnce(Result<Value, RemoteError>) -> CallbackResult + Send>;

/// Parameters of a single connect attempt
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub options: TransportOptions,
}

/// Lifecycle observers registered atomically with the connect call, so no
/// notification can fire before they are in place.
pub struct ConnectionEvents {
    pub on_connected: ConnectedCallback,
    pub on_disconnect: DisconnectCallback,
}

impl Debug for ConnectionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvents").finish_non_exhaustive()
    }
}

/// Readiness and error observers of one subscription
pub struct SubscribeCallbacks {
    pub on_ready: Box<dyn FnOnce() -> CallbackResult + Send>,
    /// May fire before or after `on_ready`
    pub on_error: Box<dyn FnOnce(RemoteError) -> CallbackResult + Send>,
}

impl Debug for SubscribeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeCallbacks").finish_non_exhaustive()
    }
}

/// Service registry able to open connections (the "DDP package" of the host)
pub trait Transport: Send + Sync + Debug {
    /// Start connecting. Returns immediately with a handle; the outcome is
    /// reported through `events`.
    fn connect(
        &self,
        request: ConnectRequest,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An open (or opening) transport session
pub trait Connection: Send + Sync + Debug {
    /// Invoke a remote method; `callback` fires once with its outcome
    fn apply(&self, name: &str, args: Vec<Value>, callback: ResultCallback);

    /// Start a subscription; readiness and errors arrive through `callbacks`
    fn subscribe(
        &self,
        name: &str,
        args: Vec<Value>,
        callbacks: SubscribeCallbacks,
    ) -> Box<dyn Subscription>;

    /// Tear the session down. Any resulting disconnect is still reported.
    fn close(&self);
}

/// Handle to a live subscription
pub trait Subscription: Send + Sync + Debug {
    fn id(&self) -> &str;
    fn stop(&self);
}
