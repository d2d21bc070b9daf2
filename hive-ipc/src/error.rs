//! IPC error types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// IPC result type
pub type IpcResult<T> = Result<T, IpcError>;

/// Wire-level error code, shared by servers and clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionLost,
    AuthenticationFailed,
    MessageTooLarge,
    RateLimitExceeded,
    Timeout,
    ProtocolError,
    TransportError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPC error types
#[derive(Debug, Clone, Error)]
pub enum IpcError {
    /// Establishing a connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection went away or was never there
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Handshake token or allow-list check failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Serialized envelope exceeds the configured ceiling
    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    /// Token bucket for the connection is empty
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Timeout waiting for response
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed, unexpected or unhandled message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Bind, accept or I/O failure in the transport
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl IpcError {
    /// Timeout error for a named command
    pub fn timeout(command: &str, after: Duration) -> Self {
        IpcError::Timeout(format!(
            "request '{}' timed out after {}ms",
            command,
            after.as_millis()
        ))
    }

    /// Size ceiling error
    pub fn too_large(size: usize, max: usize) -> Self {
        IpcError::MessageTooLarge(format!(
            "{} bytes exceeds maximum of {} bytes",
            size, max
        ))
    }

    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            IpcError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            IpcError::ConnectionLost(_) => ErrorCode::ConnectionLost,
            IpcError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            IpcError::MessageTooLarge(_) => ErrorCode::MessageTooLarge,
            IpcError::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            IpcError::Timeout(_) => ErrorCode::Timeout,
            IpcError::ProtocolError(_) => ErrorCode::ProtocolError,
            IpcError::TransportError(_) => ErrorCode::TransportError,
        }
    }

    /// Human readable detail without the code prefix
    pub fn detail(&self) -> String {
        match self {
            IpcError::ConnectionFailed(m)
            | IpcError::ConnectionLost(m)
            | IpcError::AuthenticationFailed(m)
            | IpcError::MessageTooLarge(m)
            | IpcError::RateLimitExceeded(m)
            | IpcError::Timeout(m)
            | IpcError::ProtocolError(m)
            | IpcError::TransportError(m) => m.clone(),
        }
    }

    /// Rebuild an error received from a peer
    pub fn from_wire(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::ConnectionFailed => IpcError::ConnectionFailed(message),
            ErrorCode::ConnectionLost => IpcError::ConnectionLost(message),
            ErrorCode::AuthenticationFailed => IpcError::AuthenticationFailed(message),
            ErrorCode::MessageTooLarge => IpcError::MessageTooLarge(message),
            ErrorCode::RateLimitExceeded => IpcError::RateLimitExceeded(message),
            ErrorCode::Timeout => IpcError::Timeout(message),
            ErrorCode::ProtocolError => IpcError::ProtocolError(message),
            ErrorCode::TransportError => IpcError::TransportError(message),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionFailed(_)
                | IpcError::ConnectionLost(_)
                | IpcError::Timeout(_)
                | IpcError::RateLimitExceeded(_)
        )
    }

    /// Check if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::AuthenticationFailed(_) | IpcError::ProtocolError(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::TransportError(err.to_string())
        } else {
            IpcError::ProtocolError(err.to_string())
        }
    }
}
