//! Crab Sync - blocking façade over a callback-driven RPC connection
//!
//! Lets plain synchronous code connect, call remote methods and wait for
//! subscriptions on a transport that only speaks in callbacks. One session per
//! [`SyncConnection`], one blocking operation at a time, no reconnects: a lost
//! session fails whatever is pending and stays lost.

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub(crate) mod monitor;
pub mod transport;
pub(crate) mod wait;

pub use config::{CONNECT_TIMEOUT, ConnectOptions, TransportOptions};
pub use connection::{SubscriptionHandle, SyncConnection};
pub use error::{InvariantViolation, RemoteError, SyncError, SyncResult, TransportError};
pub use transport::{Connection, Handshake, MemoryService, Subscription, Transport};
