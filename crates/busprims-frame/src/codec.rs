use std::ops::BitOr;
use std::time::Duration;

use busprims_core::MESSAGE_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + flags (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "BP" (0x42 0x50).
pub const MAGIC: [u8; 2] = [0x42, 0x50];

/// Default maximum payload size of a single frame: 64 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Default maximum reassembled envelope body: 1 MiB.
pub const DEFAULT_MAX_ENVELOPE: usize = 1024 * 1024;

/// Default bound on receiving one whole envelope.
pub const DEFAULT_MULTIPART_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// More parts of the same envelope follow.
    pub const MORE: FrameFlags = FrameFlags(0x0001);
    /// Connection greeting carrying the sender's routing identity.
    pub const GREETING: FrameFlags = FrameFlags(0x0002);

    const KNOWN: u16 = Self::MORE.0 | Self::GREETING.0;

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    /// `MORE` when `more` is set, empty otherwise.
    pub const fn more(more: bool) -> Self {
        if more {
            Self::MORE
        } else {
            Self::empty()
        }
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Flags from raw bits, rejecting bits this version does not know.
    pub const fn from_bits(bits: u16) -> Option<Self> {
        if bits & !Self::KNOWN == 0 {
            Some(FrameFlags(bits))
        } else {
            None
        }
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// One frame: flags plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: FrameFlags, payload: impl Into<Bytes>) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    /// An envelope part, marked `MORE` unless it is the last one.
    pub fn part(payload: impl Into<Bytes>, more: bool) -> Self {
        Self::new(FrameFlags::more(more), payload)
    }

    /// A connection greeting announcing `identity` (may be empty).
    pub fn greeting(identity: impl Into<Bytes>) -> Self {
        Self::new(FrameFlags::GREETING, identity)
    }

    pub fn has_more(&self) -> bool {
        self.flags.contains(FrameFlags::MORE)
    }

    pub fn is_greeting(&self) -> bool {
        self.flags.contains(FrameFlags::GREETING)
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Flags    │ Payload          │
/// │ 0x42 0x50    │ (4B LE)   │ (2B LE)  │ (Length bytes)   │
/// │ "BP"         │           │          │                  │
/// └──────────────┴───────────┴──────────┴─────────────────┘
/// ```
pub fn encode_frame(flags: FrameFlags, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len);
    dst.put_u16_le(flags.bits());
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let mut header = &src[2..HEADER_SIZE];
    let payload_len = header.get_u32_le() as usize;
    let raw_flags = header.get_u16_le();

    let flags = FrameFlags::from_bits(raw_flags).ok_or(FrameError::UnknownFlags(raw_flags))?;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { flags, payload }))
}

/// Configuration for framing and envelope handling.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size of one frame. Default: 64 KiB.
    pub max_payload_size: usize,
    /// Maximum reassembled envelope body. Default: 1 MiB.
    pub max_envelope_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
    /// Bound on receiving every part of one envelope. Default: 2s.
    pub multipart_timeout: Duration,
    /// Largest body chunk written per frame. Default: one message (302 bytes).
    pub chunk_size: usize,
}

impl FrameConfig {
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_multipart_timeout(mut self, timeout: Duration) -> Self {
        self.multipart_timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_envelope_size: DEFAULT_MAX_ENVELOPE,
            read_timeout: None,
            write_timeout: None,
            multipart_timeout: DEFAULT_MULTIPART_TIMEOUT,
            chunk_size: MESSAGE_SIZE,
        }
    }
}
