//! Multipart envelopes.
//!
//! One logical message travels as an envelope:
//!
//! ```text
//! [identity] MORE
//! []         MORE     empty delimiter
//! [chunk 1]  MORE
//! ...
//! [chunk n]           last chunk unmarked
//! ```
//!
//! Chunks never exceed the configured chunk size. An empty payload still
//! produces one zero-length final chunk, so the receiver always observes a
//! terminated envelope. Replies routed back to a client omit the identity
//! frame and start at the delimiter (a "body").

use std::fmt;
use std::io::Write;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::codec::{encode_frame, Frame, FrameFlags};
use crate::error::{FrameError, Result};
use crate::reader::{FrameReader, ReadTimeout};
use crate::writer::write_all;

/// Envelope part that failed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Identity,
    Delimiter,
    Chunk { index: usize },
}

impl fmt::Display for SendStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStage::Identity => f.write_str("identity"),
            SendStage::Delimiter => f.write_str("delimiter"),
            SendStage::Chunk { index } => write!(f, "chunk #{index}"),
        }
    }
}

/// Number of chunks `len` bytes split into. Always at least one.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size.max(1))
    }
}

/// Split `payload` into `(chunk, more)` pairs of at most `chunk_size` bytes.
pub fn chunks(payload: &[u8], chunk_size: usize) -> Chunks<'_> {
    Chunks {
        rest: payload,
        size: chunk_size.max(1),
        done: false,
    }
}

/// Iterator returned by [`chunks`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    rest: &'a [u8],
    size: usize,
    done: bool,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = (&'a [u8], bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let take = self.rest.len().min(self.size);
        let (chunk, rest) = self.rest.split_at(take);
        self.rest = rest;
        let more = !rest.is_empty();
        self.done = !more;
        Some((chunk, more))
    }
}

/// A received envelope: routing identity plus body chunks in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    identity: Bytes,
    parts: Vec<Bytes>,
}

impl Envelope {
    pub fn new(identity: impl Into<Bytes>, parts: Vec<Bytes>) -> Self {
        Self {
            identity: identity.into(),
            parts,
        }
    }

    /// Routing identity. Empty for bodies read on the client side.
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Total body length across every chunk.
    pub fn body_len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    /// Concatenate the body chunks.
    pub fn reassemble(&self) -> Bytes {
        match self.parts.as_slice() {
            [single] => single.clone(),
            parts => {
                let mut out = BytesMut::with_capacity(self.body_len());
                for part in parts {
                    out.extend_from_slice(part);
                }
                out.freeze()
            }
        }
    }

    /// Append the body chunks to `dst`.
    pub fn reassemble_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.body_len());
        for part in &self.parts {
            dst.extend_from_slice(part);
        }
    }

    pub fn into_parts(self) -> (Bytes, Vec<Bytes>) {
        (self.identity, self.parts)
    }
}

/// Write a full envelope (identity, delimiter, chunks) to `dst`, encoding
/// each frame through `scratch`. Returns the number of chunks written.
pub fn write_envelope<W: Write + ?Sized>(
    dst: &mut W,
    scratch: &mut BytesMut,
    identity: &[u8],
    payload: &[u8],
    chunk_size: usize,
) -> Result<usize> {
    if chunk_size == 0 {
        return Err(FrameError::InvalidChunkSize);
    }
    write_part(dst, scratch, FrameFlags::MORE, identity)
        .map_err(|err| staged(SendStage::Identity, err))?;
    write_body(dst, scratch, payload, chunk_size)
}

/// Write a body (delimiter, chunks) to `dst`. Returns the number of chunks
/// written.
pub fn write_body<W: Write + ?Sized>(
    dst: &mut W,
    scratch: &mut BytesMut,
    payload: &[u8],
    chunk_size: usize,
) -> Result<usize> {
    if chunk_size == 0 {
        return Err(FrameError::InvalidChunkSize);
    }
    write_part(dst, scratch, FrameFlags::MORE, &[])
        .map_err(|err| staged(SendStage::Delimiter, err))?;

    let mut written: usize = 0;
    for (index, (chunk, more)) in chunks(payload, chunk_size).enumerate() {
        write_part(dst, scratch, FrameFlags::more(more), chunk)
            .map_err(|err| staged(SendStage::Chunk { index }, err))?;
        written += 1;
    }
    dst.flush()
        .map_err(|err| staged(SendStage::Chunk { index: written.saturating_sub(1) }, err.into()))?;
    Ok(written)
}

/// Incremental envelope reassembly, fed one frame at a time.
///
/// Holds the parts of a partially received envelope between calls, so a
/// caller multiplexing many connections can resume where a connection
/// stalled instead of blocking on it.
#[derive(Debug, Clone)]
pub struct EnvelopeAssembler {
    with_identity: bool,
    stage: Stage,
    identity: Bytes,
    parts: Vec<Bytes>,
    body_len: usize,
    received: usize,
    max_body: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Identity,
    Delimiter,
    Chunks,
}

impl EnvelopeAssembler {
    /// Expects `[identity][delimiter][chunks]`.
    pub fn envelope(max_body: usize) -> Self {
        Self::with_stage(true, max_body)
    }

    /// Expects `[delimiter][chunks]`, as replies arrive on the client side.
    pub fn body(max_body: usize) -> Self {
        Self::with_stage(false, max_body)
    }

    fn with_stage(with_identity: bool, max_body: usize) -> Self {
        Self {
            with_identity,
            stage: if with_identity { Stage::Identity } else { Stage::Delimiter },
            identity: Bytes::new(),
            parts: Vec::new(),
            body_len: 0,
            received: 0,
            max_body,
        }
    }

    /// Frames accepted for the envelope in progress.
    pub fn received(&self) -> usize {
        self.received
    }

    /// True between envelopes.
    pub fn is_idle(&self) -> bool {
        self.received == 0
    }

    /// Add the next frame. Returns the envelope once its final chunk arrives.
    ///
    /// Errors leave the assembler mid-envelope; the stream is out of sync
    /// and should be dropped.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Envelope>> {
        if frame.is_greeting() {
            return Err(FrameError::MalformedEnvelope("greeting inside envelope"));
        }
        let more = frame.has_more();
        match self.stage {
            Stage::Identity => {
                if !more {
                    return Err(FrameError::MalformedEnvelope("identity frame without body"));
                }
                self.identity = frame.payload;
                self.stage = Stage::Delimiter;
            }
            Stage::Delimiter => {
                if !frame.payload.is_empty() {
                    return Err(FrameError::MalformedEnvelope("missing empty delimiter"));
                }
                if !more {
                    return Err(FrameError::MalformedEnvelope("delimiter without chunks"));
                }
                self.stage = Stage::Chunks;
            }
            Stage::Chunks => {
                self.body_len += frame.payload.len();
                if self.body_len > self.max_body {
                    return Err(FrameError::PayloadTooLarge {
                        size: self.body_len,
                        max: self.max_body,
                    });
                }
                self.parts.push(frame.payload);
                if !more {
                    self.received = 0;
                    return Ok(Some(self.finish()));
                }
            }
        }
        self.received += 1;
        Ok(None)
    }

    fn finish(&mut self) -> Envelope {
        let envelope = Envelope::new(
            std::mem::take(&mut self.identity),
            std::mem::take(&mut self.parts),
        );
        *self = Self::with_stage(self.with_identity, self.max_body);
        envelope
    }
}

/// Read one envelope (identity, delimiter, chunks), giving up at `deadline`.
///
/// A deadline that passes before the first frame yields
/// [`FrameError::Timeout`]; one that passes mid-envelope yields
/// [`FrameError::IncompleteEnvelope`].
pub fn read_envelope<T: ReadTimeout>(
    reader: &mut FrameReader<T>,
    deadline: Instant,
) -> Result<Envelope> {
    let max = reader.config().max_envelope_size;
    read_assembled(reader, deadline, EnvelopeAssembler::envelope(max))
}

/// Read one body (delimiter, chunks), giving up at `deadline`.
pub fn read_body<T: ReadTimeout>(reader: &mut FrameReader<T>, deadline: Instant) -> Result<Envelope> {
    let max = reader.config().max_envelope_size;
    read_assembled(reader, deadline, EnvelopeAssembler::body(max))
}

fn read_assembled<T: ReadTimeout>(
    reader: &mut FrameReader<T>,
    deadline: Instant,
    mut assembler: EnvelopeAssembler,
) -> Result<Envelope> {
    loop {
        let frame = match reader.read_frame_until(deadline) {
            Ok(frame) => frame,
            Err(FrameError::Timeout | FrameError::ConnectionClosed) if !assembler.is_idle() => {
                return Err(FrameError::IncompleteEnvelope {
                    received: assembler.received(),
                });
            }
            Err(err) => return Err(err),
        };
        if let Some(envelope) = assembler.push(frame)? {
            return Ok(envelope);
        }
    }
}

fn write_part<W: Write + ?Sized>(
    dst: &mut W,
    scratch: &mut BytesMut,
    flags: FrameFlags,
    payload: &[u8],
) -> Result<()> {
    scratch.clear();
    encode_frame(flags, payload, scratch)?;
    write_all(dst, &scratch[..])
}

fn staged(stage: SendStage, err: FrameError) -> FrameError {
    FrameError::Send {
        stage,
        source: Box::new(err),
    }
}
