use busprims_core::{Classify, ErrorCode, PoolError, Severity};
use busprims_frame::FrameError;
use busprims_transport::TransportError;

/// Errors that can occur in transmitter, receiver and bus operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Slot pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Every send buffer is lent out.
    #[error("send buffer pool exhausted ({capacity} slots in use)")]
    BufferFull { capacity: usize },

    /// No routing identity is configured for this transmitter.
    #[error("identity option must be set before sending")]
    MissingIdentity,

    /// The transmitter has no live connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called on a transmitter that is not disconnected.
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    /// No live connection announced this identity.
    #[error("no connection for identity {0:?}")]
    UnknownPeer(String),

    /// The receiver has not been bound.
    #[error("receiver is not listening")]
    NotListening,
}

impl RouterError {
    /// Whether the connection that produced this error is unusable.
    pub fn is_fatal_to_stream(&self) -> bool {
        match self {
            RouterError::Frame(err) => err.is_fatal_to_stream(),
            RouterError::Transport(TransportError::Io(_)) => true,
            _ => false,
        }
    }
}

impl Classify for RouterError {
    fn code(&self) -> ErrorCode {
        match self {
            RouterError::Transport(err) => err.code(),
            RouterError::Frame(err) => err.code(),
            RouterError::Pool(err) => err.code(),
            RouterError::BufferFull { .. } => ErrorCode::BufferFull,
            RouterError::MissingIdentity => ErrorCode::InvalidIdentity,
            RouterError::NotConnected | RouterError::AlreadyConnected(_) => ErrorCode::Connect,
            RouterError::UnknownPeer(_) => ErrorCode::SendFrame,
            RouterError::NotListening => ErrorCode::Listen,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            RouterError::Transport(err) => err.severity(),
            RouterError::Frame(err) => err.severity(),
            RouterError::Pool(err) => err.severity(),
            RouterError::BufferFull { .. }
            | RouterError::NotConnected
            | RouterError::AlreadyConnected(_) => Severity::Low,
            RouterError::MissingIdentity
            | RouterError::UnknownPeer(_)
            | RouterError::NotListening => Severity::Medium,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
