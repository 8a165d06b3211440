use std::path::PathBuf;
use std::time::Duration;

use busprims_core::{Classify, ErrorCode, Severity};

/// Errors that can occur in IPC transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified endpoint.
    #[error("failed to bind to {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        endpoint: String,
        reason: &'static str,
    },

    /// The stream did not become ready before the deadline.
    #[error("timed out after {after:?} waiting for {endpoint}")]
    Timeout { endpoint: String, after: Duration },

    /// The readiness poll itself failed.
    #[error("poll failed: {0}")]
    PollFailed(std::io::Error),

    /// A socket option was rejected.
    #[error("invalid socket option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl Classify for TransportError {
    fn code(&self) -> ErrorCode {
        match self {
            TransportError::Bind { .. } => ErrorCode::Bind,
            TransportError::Connect { .. } => ErrorCode::Connect,
            TransportError::Accept(_) => ErrorCode::Listen,
            TransportError::Io(_) => ErrorCode::RecvFrame,
            TransportError::PathTooLong { .. } | TransportError::InvalidEndpoint { .. } => {
                ErrorCode::InvalidEndpoint
            }
            TransportError::Timeout { .. } => ErrorCode::Timeout,
            TransportError::PollFailed(_) => ErrorCode::PollFailed,
            TransportError::InvalidOption {
                option: "identity", ..
            } => ErrorCode::InvalidIdentity,
            TransportError::InvalidOption { .. } => ErrorCode::SetSockopt,
            TransportError::Shutdown => ErrorCode::SocketClose,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            TransportError::Bind { .. } | TransportError::Connect { .. } => Severity::High,
            TransportError::Shutdown => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
