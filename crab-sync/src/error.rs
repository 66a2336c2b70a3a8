//! Error types for the blocking connection façade
//!
//! Three families live side by side:
//! - [`InvariantViolation`]: bookkeeping bugs, always fatal
//! - [`RemoteError`]: failures reported by the remote method or publication
//! - [`TransportError`]: failures reported by the transport session itself

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// `error_type` tag carried by a transport-initiated forced reconnect
pub const FORCED_RECONNECT: &str = "ForcedReconnectError";

/// `error_type` tag carried by a connect attempt that ran out of time
pub const CONNECT_TIMEOUT_ERROR: &str = "ConnectTimeoutError";

/// Conditions that can only arise from a bug in the caller or in the
/// façade's own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// A blocking operation was started while another one was outstanding
    #[error("another blocking operation is already pending on this connection")]
    OperationPending,

    /// The transport reported a successful connect while no connect was pending
    #[error("connect callback fired but the pending wait is not the connect wait")]
    UnexpectedConnect,

    /// A method result arrived after its wait had already been claimed
    #[error("method result arrived with no pending wait")]
    ResultWithoutWait,

    /// A subscription became ready after its wait had already been claimed
    #[error("subscription ready arrived with no pending wait")]
    ReadyWithoutWait,

    /// The transport forced a reconnect on an already established session
    #[error("forced reconnect after the connection was established")]
    ForcedReconnectAfterConnect,

    /// The blocked caller went away before its wait was resolved
    #[error("wait slot resolved after its waiter was abandoned")]
    SlotAbandoned,

    /// The resolving side of a wait was dropped without resolving it
    #[error("wait slot dropped without being resolved")]
    SlotDropped,
}

/// Error reported by the remote service for a single method call or subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable code, e.g. `"404"` or `"not-authorized"`
    pub error: String,
    /// Human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Arbitrary structured payload attached by the remote side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RemoteError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: None,
            details: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// `404` error used for unknown methods and publications
    pub fn not_found(what: &str, name: &str) -> Self {
        Self::new("404").with_reason(format!("{} '{}' not found", what, name))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} [{}]", reason, self.error),
            None => write!(f, "[{}]", self.error),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Error reported by the transport session (connect failures, drops, timeouts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    /// Optional kind tag; [`FORCED_RECONNECT`] marks a self-requested reconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// The signal a transport emits when it drops the socket on purpose
    /// (for instance after a protocol version mismatch) and intends to retry.
    pub fn forced_reconnect(message: impl Into<String>) -> Self {
        Self::new(message).with_type(FORCED_RECONNECT)
    }

    pub fn connect_timeout(after: std::time::Duration) -> Self {
        Self::new(format!("connect timed out after {:?}", after)).with_type(CONNECT_TIMEOUT_ERROR)
    }

    pub fn is_forced_reconnect(&self) -> bool {
        self.error_type.as_deref() == Some(FORCED_RECONNECT)
    }
}

/// Error type for all façade operations and transport callbacks
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Should never happen; signals a bug rather than a runtime condition
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// The remote method or publication reported failure
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The session dropped with an explicit error while an operation was pending
    #[error("disconnected: {0}")]
    Disconnected(TransportError),

    /// The session dropped cleanly while an operation was pending
    #[error("connection lost")]
    ConnectionLost,

    /// The session is already gone; nothing can be sent on it
    #[error("not connected")]
    NotConnected,

    /// The façade has been closed
    #[error("connection closed")]
    Closed,

    /// The transport refused the request synchronously
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// An error surfaced while nobody was waiting for it
    #[error("unhandled error with no pending wait: {0}")]
    Orphaned(Box<SyncError>),
}

impl SyncError {
    /// True for conditions that indicate a bug, never a remote or network failure
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Invariant(_) => true,
            SyncError::Orphaned(inner) => inner.is_fatal(),
            _ => false,
        }
    }

    pub fn invariant(&self) -> Option<InvariantViolation> {
        match self {
            SyncError::Invariant(violation) => Some(*violation),
            _ => None,
        }
    }

    pub(crate) fn orphaned(self) -> Self {
        SyncError::Orphaned(Box::new(self))
    }
}

/// Result type for façade operations
pub type SyncResult<T> = Result<T, SyncError>;
