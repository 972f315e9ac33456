//! Error taxonomy for the JSON-RPC link.
//!
//! Every failure mode has a recoverable outcome: a failed call, a dropped
//! frame, or a connection-state transition. Nothing here is fatal.

use std::time::Duration;

use thiserror::Error;

use crate::codec::JsonRpcError;

/// Errors surfaced by the link.
///
/// The type is `Clone` so that a single in-flight connection attempt can hand
/// the same outcome to every caller awaiting it.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// The endpoint could not be resolved (missing, malformed, or not
    /// supplied before the resolve timeout).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Opening the physical connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection went away while the call was pending.
    #[error("Connection lost")]
    ConnectionLost,

    /// `call()` was invoked while the link was not connected.
    #[error("Not connected to server")]
    NotConnected,

    /// An in-flight connection attempt was abandoned by `disconnect()`.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// No response arrived within the per-call deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed frame or envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    ServerError {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },
}

impl LinkError {
    /// True for failures that concern the connection rather than one call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionFailed(_)
                | LinkError::ConnectionLost
                | LinkError::NotConnected
                | LinkError::Cancelled
        )
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                LinkError::ConnectionFailed(err.to_string())
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => LinkError::ConnectionLost,
            _ => LinkError::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<JsonRpcError> for LinkError {
    fn from(err: JsonRpcError) -> Self {
        LinkError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_display() {
        let timeout_err = LinkError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout_err.to_string(), "Request timed out after 30s");

        let server_err = LinkError::ServerError {
            code: -32000,
            message: "Database error".to_string(),
            data: None,
        };
        assert_eq!(server_err.to_string(), "Server error -32000: Database error");

        let protocol_err = LinkError::Protocol("Invalid JSON".to_string());
        assert_eq!(protocol_err.to_string(), "Protocol error: Invalid JSON");

        assert_eq!(LinkError::NotConnected.to_string(), "Not connected to server");
    }

    #[test]
    fn test_link_error_from_io() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: LinkError = refused.into();
        assert!(matches!(err, LinkError::ConnectionFailed(_)));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: LinkError = reset.into();
        assert!(matches!(err, LinkError::ConnectionLost));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        let err: LinkError = other.into();
        assert!(matches!(err, LinkError::ConnectionFailed(_)));
    }

    #[test]
    fn test_link_error_from_json_rpc() {
        let json_err = JsonRpcError {
            code: -32601,
            message: "Method not found".to_string(),
            data: Some(serde_json::json!({"method": "unknown"})),
        };

        match LinkError::from(json_err) {
            LinkError::ServerError { code, message, data } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
                assert!(data.is_some());
            }
            other => panic!("Expected ServerError, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(LinkError::ConnectionLost.is_connection_error());
        assert!(LinkError::NotConnected.is_connection_error());
        assert!(!LinkError::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(!LinkError::Protocol("x".into()).is_connection_error());
    }
}
