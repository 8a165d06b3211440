use std::io::{Cursor, ErrorKind, Read};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use busprims_transport::{IpcStream, TransportError};

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Bytes requested from the stream per read; also the initial buffer size.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Streams whose blocking reads can be bounded by a timeout.
pub trait ReadTimeout: Read {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl ReadTimeout for IpcStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        IpcStream::set_read_timeout(self, timeout).map_err(|err| match err {
            TransportError::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        })
    }
}

impl ReadTimeout for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

impl ReadTimeout for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// In-memory sources never block.
impl<T: AsRef<[u8]>> ReadTimeout for Cursor<T> {
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> std::io::Result<()> {
        Ok(())
    }
}

/// Buffers a byte stream and hands out whole frames.
///
/// Bytes past the end of the returned frame stay buffered for the next call,
/// so a multipart envelope that arrived in one read is decoded without
/// touching the stream again.
pub struct FrameReader<T> {
    stream: T,
    pending: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(stream: T) -> Self {
        Self::with_config(stream, FrameConfig::default())
    }

    pub fn with_config(stream: T, config: FrameConfig) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(READ_CHUNK_SIZE),
            config,
        }
    }

    /// Block until a frame is complete. EOF or a reset by the peer is
    /// [`FrameError::ConnectionClosed`], also when it cuts a frame short.
    pub fn read_frame(&mut self) -> Result<Frame> {
        self.next_frame(|_| Ok(()))
    }

    /// A frame already complete in the buffer, without touching the stream.
    pub fn next_buffered(&mut self) -> Result<Option<Frame>> {
        decode_frame(&mut self.pending, self.config.max_payload_size)
    }

    /// One read from the stream into the buffer. Meant for a stream that just
    /// polled readable, where the read does not block.
    pub fn read_available(&mut self) -> Result<()> {
        self.fill()
    }

    /// Bytes received but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn next_frame(&mut self, mut arm: impl FnMut(&T) -> Result<()>) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.pending, self.config.max_payload_size)? {
                return Ok(frame);
            }
            arm(&self.stream)?;
            self.fill()?;
        }
    }

    /// Append one read's worth of bytes to `pending`.
    fn fill(&mut self) -> Result<()> {
        let start = self.pending.len();
        self.pending.resize(start + READ_CHUNK_SIZE, 0);
        let outcome = loop {
            match self.stream.read(&mut self.pending[start..]) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let read = *outcome.as_ref().unwrap_or(&0);
        self.pending.truncate(start + read);

        match outcome {
            Ok(0) => Err(FrameError::ConnectionClosed),
            Ok(_) => Ok(()),
            Err(err) if is_hangup(err.kind()) => Err(FrameError::ConnectionClosed),
            Err(err) => Err(FrameError::Io(err)),
        }
    }
}

fn is_hangup(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

impl<T: ReadTimeout> FrameReader<T> {
    /// Like [`read_frame`](Self::read_frame), but gives up with
    /// [`FrameError::Timeout`] at `deadline`.
    ///
    /// A timeout keeps whatever part of the frame already arrived, so the
    /// caller can retry without losing stream synchronisation. The configured
    /// read timeout is restored before returning.
    pub fn read_frame_until(&mut self, deadline: Instant) -> Result<Frame> {
        let result = self.next_frame(|stream| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FrameError::Timeout);
            }
            stream.set_read_timeout(Some(remaining))?;
            Ok(())
        });
        let restored = self.stream.set_read_timeout(self.config.read_timeout);

        let frame = result.map_err(|err| match err {
            FrameError::Io(io)
                if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                FrameError::Timeout
            }
            other => other,
        })?;
        restored?;
        Ok(frame)
    }
}

impl FrameReader<IpcStream> {
    /// Reader over a connected bus stream, with the configured read timeout
    /// applied to the stream.
    pub fn with_config_ipc(stream: IpcStream, config: FrameConfig) -> Result<Self> {
        ReadTimeout::set_read_timeout(&stream, config.read_timeout)?;
        Ok(Self::with_config(stream, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::BufMut;
    use busprims_core::MESSAGE_SIZE;

    use super::*;
    use crate::codec::{encode_frame, FrameFlags, MAGIC};

    fn wire(frames: &[(FrameFlags, &[u8])]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for (flags, payload) in frames {
            encode_frame(*flags, payload, &mut out).unwrap();
        }
        out.to_vec()
    }

    /// Yields the scripted results one `read` call at a time.
    struct Scripted {
        steps: Vec<std::io::Result<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.steps.is_empty() {
                return Ok(0);
            }
            let bytes = self.steps.remove(0)?;
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            if n < bytes.len() {
                self.steps.insert(0, Ok(bytes[n..].to_vec()));
            }
            Ok(n)
        }
    }

    #[test]
    fn greeting_and_envelope_arrive_in_one_read() {
        let message = vec![0x5a; MESSAGE_SIZE];
        let bytes = wire(&[
            (FrameFlags::GREETING, b"peerxxx"),
            (FrameFlags::MORE, b"peerxxx"),
            (FrameFlags::MORE, b""),
            (FrameFlags::MORE, &message[..256]),
            (FrameFlags::empty(), &message[256..]),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let greeting = reader.read_frame().unwrap();
        assert!(greeting.is_greeting());
        assert_eq!(greeting.payload.as_ref(), b"peerxxx");
        assert!(reader.buffered() > 0);

        let parts: Vec<Frame> = (0..4).map(|_| reader.read_frame().unwrap()).collect();
        assert!(parts[1].payload.is_empty());
        assert_eq!(parts[2].payload.len() + parts[3].payload.len(), MESSAGE_SIZE);
        assert!(!parts[3].has_more());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn buffered_frames_come_out_one_read_at_a_time() {
        let bytes = wire(&[(FrameFlags::MORE, b"first"), (FrameFlags::empty(), b"second")]);
        let mut reader = FrameReader::new(Scripted {
            steps: vec![Ok(bytes[..20].to_vec()), Ok(bytes[20..].to_vec())],
        });
        assert!(reader.next_buffered().unwrap().is_none());

        reader.read_available().unwrap();
        assert_eq!(reader.next_buffered().unwrap().unwrap().payload.as_ref(), b"first");
        assert!(reader.next_buffered().unwrap().is_none());
        assert!(reader.buffered() > 0);

        reader.read_available().unwrap();
        assert_eq!(reader.next_buffered().unwrap().unwrap().payload.as_ref(), b"second");
        assert!(matches!(
            reader.read_available().unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn frame_split_across_many_reads() {
        let bytes = wire(&[(FrameFlags::empty(), b"dribbled")]);
        let steps = bytes.iter().map(|b| Ok(vec![*b])).collect();
        let mut reader = FrameReader::new(Scripted { steps });

        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), b"dribbled");
    }

    #[test]
    fn eof_inside_header_or_payload_is_connection_closed() {
        let mut cut = BytesMut::new();
        cut.put_slice(&MAGIC);
        cut.put_u32_le(16);
        cut.put_u16_le(FrameFlags::MORE.bits());
        cut.put_slice(b"half");

        for bytes in [Vec::new(), MAGIC.to_vec(), cut.to_vec()] {
            let mut reader = FrameReader::new(Cursor::new(bytes));
            assert!(matches!(
                reader.read_frame().unwrap_err(),
                FrameError::ConnectionClosed
            ));
        }
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let mut reader = FrameReader::new(Cursor::new(vec![b'Z'; 8]));
        assert!(matches!(reader.read_frame().unwrap_err(), FrameError::InvalidMagic));

        let mut header = BytesMut::new();
        header.put_slice(&MAGIC);
        header.put_u32_le(4096);
        header.put_u16_le(0);
        let config = FrameConfig {
            max_payload_size: 256,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(header.to_vec()), config);
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::PayloadTooLarge { size: 4096, max: 256 }
        ));
    }

    #[test]
    fn interrupted_reads_are_retried_other_errors_surface() {
        let bytes = wire(&[(FrameFlags::empty(), b"ok")]);
        let mut reader = FrameReader::new(Scripted {
            steps: vec![Err(ErrorKind::Interrupted.into()), Ok(bytes.clone())],
        });
        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), b"ok");

        let mut reader = FrameReader::new(Scripted {
            steps: vec![Err(ErrorKind::PermissionDenied.into()), Ok(bytes)],
        });
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::Io(err) if err.kind() == ErrorKind::PermissionDenied
        ));
    }

    #[test]
    fn peer_reset_reads_as_closed() {
        for kind in [ErrorKind::ConnectionReset, ErrorKind::BrokenPipe] {
            let mut reader = FrameReader::new(Scripted {
                steps: vec![Ok(MAGIC.to_vec()), Err(kind.into())],
            });
            assert!(matches!(
                reader.read_frame().unwrap_err(),
                FrameError::ConnectionClosed
            ));
        }
    }

    #[test]
    fn deadline_keeps_partial_frame_for_retry() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let bytes = wire(&[(FrameFlags::MORE, b"stalled chunk")]);
        tx.write_all(&bytes[..10]).unwrap();

        let mut reader = FrameReader::new(rx);
        let started = Instant::now();
        let err = reader
            .read_frame_until(Instant::now() + Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(reader.buffered(), 10);

        tx.write_all(&bytes[10..]).unwrap();
        let frame = reader
            .read_frame_until(Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert!(frame.has_more());
        assert_eq!(frame.payload.as_ref(), b"stalled chunk");
    }

    #[test]
    fn past_deadline_fails_without_reading() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(rx);
        assert!(matches!(
            reader.read_frame_until(Instant::now()).unwrap_err(),
            FrameError::Timeout
        ));
    }

    #[test]
    fn ipc_reader_applies_configured_read_timeout() {
        let (stream, _peer) = IpcStream::pair().unwrap();
        let config = FrameConfig::default().with_read_timeout(Some(Duration::from_millis(10)));

        let mut reader = FrameReader::with_config_ipc(stream, config).unwrap();
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::Io(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        ));
    }
}
