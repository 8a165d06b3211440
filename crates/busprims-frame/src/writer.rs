use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use busprims_transport::{IpcStream, TransportError};

use crate::codec::{encode_frame, Frame, FrameConfig, FrameFlags, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Encodes frames into a reused scratch buffer and writes each one whole.
pub struct FrameWriter<T> {
    stream: T,
    scratch: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(stream: T) -> Self {
        Self::with_config(stream, FrameConfig::default())
    }

    pub fn with_config(stream: T, config: FrameConfig) -> Self {
        let scratch = BytesMut::with_capacity(HEADER_SIZE + config.chunk_size);
        Self {
            stream,
            scratch,
            config,
        }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_part(frame.flags, &frame.payload)
    }

    /// Encode one frame and write it, then flush.
    ///
    /// An oversized payload is rejected before anything reaches the stream.
    pub fn write_part(&mut self, flags: FrameFlags, payload: &[u8]) -> Result<()> {
        let max = self.config.max_payload_size;
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        self.scratch.clear();
        encode_frame(flags, payload, &mut self.scratch)?;
        write_all(&mut self.stream, &self.scratch)?;
        retry(|| self.stream.flush())
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    /// The raw stream, for writers that encode whole envelopes themselves.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }
}

impl FrameWriter<IpcStream> {
    /// Writer over a connected bus stream, with the configured write timeout
    /// applied to the stream.
    pub fn with_config_ipc(stream: IpcStream, config: FrameConfig) -> Result<Self> {
        stream
            .set_write_timeout(config.write_timeout)
            .map_err(|err| match err {
                TransportError::Io(io) => FrameError::Io(io),
                other => FrameError::Io(std::io::Error::other(other.to_string())),
            })?;
        Ok(Self::with_config(stream, config))
    }
}

/// Write all of `bytes`. A zero-length write means the peer is gone.
pub(crate) fn write_all<W: Write + ?Sized>(dst: &mut W, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        let written = retry(|| dst.write(bytes))?;
        if written == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        bytes = &bytes[written..];
    }
    Ok(())
}

/// Run `op` until it stops failing with `Interrupted` or `WouldBlock`.
fn retry<R>(mut op: impl FnMut() -> std::io::Result<R>) -> Result<R> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;
    use crate::codec::decode_frame;

    fn frames_in(bytes: &[u8]) -> Vec<Frame> {
        let mut wire = BytesMut::from(bytes);
        std::iter::from_fn(|| decode_frame(&mut wire, usize::MAX).unwrap()).collect()
    }

    /// Accepts at most `limit` bytes per write and fails the first calls
    /// with the queued errors.
    struct Choppy {
        errors: Vec<ErrorKind>,
        limit: usize,
        data: Vec<u8>,
        flushes: usize,
    }

    impl Choppy {
        fn new(errors: Vec<ErrorKind>, limit: usize) -> Self {
            Self {
                errors,
                limit,
                data: Vec::new(),
                flushes: 0,
            }
        }
    }

    impl Write for Choppy {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.errors.pop() {
                return Err(kind.into());
            }
            let n = buf.len().min(self.limit);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn greeting_then_delimited_body() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        writer.write_frame(&Frame::greeting(&b"manager"[..])).unwrap();
        writer.write_part(FrameFlags::MORE, b"").unwrap();
        writer.write_part(FrameFlags::empty(), b"body").unwrap();

        let frames = frames_in(writer.get_ref().get_ref());
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_greeting());
        assert_eq!(frames[0].payload.as_ref(), b"manager");
        assert!(frames[1].has_more());
        assert!(frames[1].payload.is_empty());
        assert_eq!(frames[2], Frame::part(&b"body"[..], false));
    }

    #[test]
    fn oversized_payload_writes_nothing() {
        let config = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), config);

        let err = writer.write_part(FrameFlags::empty(), b"too long").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 8, max: 4 }));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn short_and_transient_writes_still_deliver_whole_frame() {
        let sink = Choppy::new(vec![ErrorKind::WouldBlock, ErrorKind::Interrupted], 3);
        let mut writer = FrameWriter::new(sink);
        writer.write_part(FrameFlags::MORE, b"chunked").unwrap();

        let sink = writer.get_ref();
        assert_eq!(sink.flushes, 1);
        assert_eq!(frames_in(&sink.data), vec![Frame::part(&b"chunked"[..], true)]);
    }

    #[test]
    fn zero_length_write_means_closed() {
        let mut writer = FrameWriter::new(Choppy::new(Vec::new(), 0));
        assert!(matches!(
            writer.write_part(FrameFlags::empty(), b"x").unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn hard_errors_surface() {
        let mut writer = FrameWriter::new(Choppy::new(vec![ErrorKind::BrokenPipe], 64));
        assert!(matches!(
            writer.write_part(FrameFlags::empty(), b"x").unwrap_err(),
            FrameError::Io(err) if err.kind() == ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn ipc_writer_accepts_write_timeout() {
        let (stream, _peer) = IpcStream::pair().unwrap();
        let config = FrameConfig::default().with_write_timeout(Some(Duration::from_millis(10)));
        assert!(FrameWriter::with_config_ipc(stream, config).is_ok());
    }
}
