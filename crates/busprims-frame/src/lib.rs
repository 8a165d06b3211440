//! Length-prefixed framing and multipart envelopes for the bus.
//!
//! Every frame on the wire carries:
//! - A 2-byte magic number ("BP") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian flags field (`MORE`, `GREETING`)
//!
//! Frames group into envelopes (`[identity][delimiter][chunks...]`, see
//! [`multipart`]). Envelope reads are bounded by a deadline, so a sender
//! that stalls mid-envelope cannot wedge the receiver.

pub mod codec;
pub mod error;
pub mod multipart;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameFlags, DEFAULT_MAX_ENVELOPE,
    DEFAULT_MAX_PAYLOAD, DEFAULT_MULTIPART_TIMEOUT, HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use multipart::{
    chunk_count, chunks, read_body, read_envelope, write_body, write_envelope, Chunks, Envelope,
    EnvelopeAssembler, SendStage,
};
pub use reader::{FrameReader, ReadTimeout};
pub use writer::FrameWriter;
