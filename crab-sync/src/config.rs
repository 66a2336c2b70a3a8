// crab-sync/src/config.rs
// Connection configuration: what the caller asks for, and what the transport gets

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Connect timeout handed to every transport.
///
/// Longer than the usual 10 s default: shorter values produced spurious
/// timeouts while the host was busy with parallel build and bundling work.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Caller-supplied connection configuration
///
/// Loadable from JSON, e.g.
/// `{"headers": {"x-api-key": "..."}, "suppress_errors": true}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Extra headers sent with the transport handshake
    pub headers: BTreeMap<String, String>,
    /// Do not print connection errors
    pub suppress_errors: bool,
    /// Requested retry policy; always overridden to `false`
    pub retry: Option<bool>,
    /// Requested connect timeout; always overridden to [`CONNECT_TIMEOUT`]
    #[serde(with = "opt_millis")]
    pub connect_timeout: Option<Duration>,
    /// Transport-specific options, passed through untouched
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handshake header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the "do not print errors" flag
    pub fn with_suppress_errors(mut self, suppress: bool) -> Self {
        self.suppress_errors = suppress;
        self
    }

    /// Request a retry policy (ignored, see [`TransportOptions`])
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Request a connect timeout (ignored, see [`TransportOptions`])
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Add a transport-specific passthrough option
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Options actually handed to [`Transport::connect`](crate::transport::Transport::connect)
///
/// Built only through [`TransportOptions::from_connect_options`], which pins the
/// fail-fast policy: one session, no automatic reconnect, 15 s to connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportOptions {
    pub headers: BTreeMap<String, String>,
    pub suppress_errors: bool,
    pub retry: bool,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TransportOptions {
    pub fn from_connect_options(options: &ConnectOptions) -> Self {
        if options.retry == Some(true) {
            tracing::debug!("Ignoring retry=true: connections never reconnect");
        }
        if let Some(requested) = options.connect_timeout
            && requested != CONNECT_TIMEOUT
        {
            tracing::debug!(?requested, "Overriding connect timeout to {:?}", CONNECT_TIMEOUT);
        }

        Self {
            headers: options.headers.clone(),
            suppress_errors: options.suppress_errors,
            retry: false,
            connect_timeout: CONNECT_TIMEOUT,
            extra: options.extra.clone(),
        }
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
