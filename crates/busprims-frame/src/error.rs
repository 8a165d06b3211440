use busprims_core::{Classify, ErrorCode, Severity};

use crate::multipart::SendStage;

/// Errors that can occur during frame encoding/decoding and envelope
/// transfer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4250 \"BP\")")]
    InvalidMagic,

    /// The frame header sets flag bits this version does not understand.
    #[error("unknown frame flags {0:#06x}")]
    UnknownFlags(u16),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// No complete frame arrived before the deadline.
    #[error("timed out waiting for frame")]
    Timeout,

    /// The envelope started but its remaining parts never arrived.
    #[error("incomplete envelope ({received} parts received before the deadline)")]
    IncompleteEnvelope { received: usize },

    /// The frame sequence does not form a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// Writing one part of an envelope failed.
    #[error("failed to send {stage} frame: {source}")]
    Send {
        stage: SendStage,
        #[source]
        source: Box<FrameError>,
    },

    /// Chunk size must be at least one byte.
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
}

impl FrameError {
    /// Whether the underlying stream is gone or out of sync and should be
    /// dropped.
    pub fn is_fatal_to_stream(&self) -> bool {
        match self {
            FrameError::Timeout | FrameError::InvalidChunkSize => false,
            FrameError::Send { source, .. } => source.is_fatal_to_stream(),
            _ => true,
        }
    }
}

impl Classify for FrameError {
    fn code(&self) -> ErrorCode {
        match self {
            FrameError::InvalidMagic
            | FrameError::UnknownFlags(_)
            | FrameError::Io(_)
            | FrameError::ConnectionClosed
            | FrameError::MalformedEnvelope(_) => ErrorCode::RecvFrame,
            FrameError::PayloadTooLarge { .. } | FrameError::InvalidChunkSize => {
                ErrorCode::BadMessageSize
            }
            FrameError::Timeout => ErrorCode::Timeout,
            FrameError::IncompleteEnvelope { .. } => ErrorCode::IncompleteEnvelope,
            FrameError::Send { .. } => ErrorCode::SendFrame,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            FrameError::ConnectionClosed | FrameError::Timeout => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
