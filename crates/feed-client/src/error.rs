//! Error taxonomy shared by every component of the feed client.
//!
//! Background loops never return these errors to an application caller; they
//! convert failures into reconnect signals instead. Direct calls made by the
//! embedding application (handshake, messaging, construction) surface them
//! synchronously.

use std::time::Duration;

use thiserror::Error;

use crate::sfs::ApiVersion;

/// Error type surfaced by the feed client.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A caller waited on the reconnect gate longer than its timeout.
    #[error("timed out after {0:?} waiting for reconnection to complete")]
    BlockTimeout(Duration),
    /// A caller's wait on the reconnect gate was cancelled.
    #[error("wait for reconnection cancelled")]
    Cancelled,
    /// The endpoint picker had nothing to offer.
    #[error("no upstream endpoints configured")]
    NoEndpoints,
    /// Establishing a connection to the selected endpoint failed.
    #[error("dial {endpoint} failed: {reason}")]
    Dial {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Transport-provided failure description.
        reason: String,
    },
    /// The dial did not finish within the configured timeout.
    #[error("dial {endpoint} timed out after {timeout:?}")]
    DialTimeout {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// An RPC issued on the current connection failed.
    #[error("{rpc} rpc failed: {status}")]
    Rpc {
        /// RPC name (`handshake`, `watch`, `messaging`).
        rpc: &'static str,
        /// Status returned by the transport.
        status: tonic::Status,
    },
    /// The upstream server speaks an incompatible protocol version.
    #[error("incompatible upstream api version {0}")]
    IncompatibleVersion(ApiVersion),
    /// The handshake response carried no api version at all.
    #[error("upstream handshake response carried no api version")]
    MissingVersion,
    /// A JSON payload could not be encoded or decoded.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// Configuration values were missing or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The named application is not part of this sidecar's identity.
    #[error("application {0} is not watched by this sidecar")]
    UnknownApp(String),
    /// Recovery gave up after the configured number of attempts.
    #[error("gave up after {0} recovery attempts")]
    RecoveryExhausted(u32),
    /// The client has been shut down.
    #[error("feed client is shut down")]
    Shutdown,
}

impl StreamError {
    /// Wraps a transport status raised by the named RPC.
    pub(crate) fn rpc(rpc: &'static str, status: tonic::Status) -> Self {
        Self::Rpc { rpc, status }
    }

    /// Returns whether the error came from the reconnect gate rather than the wire.
    pub fn is_gate_error(&self) -> bool {
        matches!(self, Self::BlockTimeout(_) | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StreamError::Dial {
            endpoint: "10.0.0.1:9510".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            error.to_string(),
            "dial 10.0.0.1:9510 failed: connection refused"
        );
    }

    #[test]
    fn test_rpc_error_keeps_status_message() {
        let error = StreamError::rpc("messaging", tonic::Status::unavailable("gone"));
        let rendered = error.to_string();
        assert!(rendered.starts_with("messaging rpc failed"));
        assert!(rendered.contains("gone"));
    }

    #[test]
    fn test_gate_errors_are_classified() {
        assert!(StreamError::Cancelled.is_gate_error());
        assert!(StreamError::BlockTimeout(Duration::from_millis(5)).is_gate_error());
        assert!(!StreamError::NoEndpoints.is_gate_error());
    }
}
