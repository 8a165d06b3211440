use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::poll::{self, Interest};

/// A connected bus stream over a Unix domain socket or TCP.
pub struct IpcStream {
    inner: Socket,
}

enum Socket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// Run the same expression against whichever socket is inside.
macro_rules! on_socket {
    ($socket:expr, $s:ident => $body:expr) => {
        match $socket {
            Socket::Unix($s) => $body,
            Socket::Tcp($s) => $body,
        }
    };
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        on_socket!(&mut self.inner, s => s.read(buf))
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        on_socket!(&mut self.inner, s => s.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        on_socket!(&mut self.inner, s => s.flush())
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        on_socket!(&self.inner, s => s.as_raw_fd())
    }
}

impl IpcStream {
    pub(crate) fn from_unix(stream: UnixStream) -> Self {
        Self {
            inner: Socket::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: Socket::Tcp(stream),
        }
    }

    /// Connected pair of Unix streams, for in-process use and tests.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(on_socket!(&self.inner, s => s.set_read_timeout(timeout))?)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(on_socket!(&self.inner, s => s.set_write_timeout(timeout))?)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        Ok(on_socket!(&self.inner, s => s.set_nonblocking(nonblocking))?)
    }

    /// Second handle on the same connection, used to split reading from
    /// writing across threads.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match &self.inner {
            Socket::Unix(s) => Self::from_unix(s.try_clone()?),
            Socket::Tcp(s) => Self::from_tcp(s.try_clone()?),
        })
    }

    /// Shut down both halves. Shutting down an already closed stream is not
    /// an error.
    pub fn shutdown(&self) -> Result<()> {
        match on_socket!(&self.inner, s => s.shutdown(Shutdown::Both)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotConnected => {
                Err(TransportError::Io(err))
            }
            _ => Ok(()),
        }
    }

    /// Block until the stream is writable or `timeout` elapses.
    pub fn wait_writable(&self, timeout: Duration) -> Result<bool> {
        Ok(poll::poll_one(self.as_raw_fd(), Interest::Writable, timeout)?.is_some())
    }

    /// Block until the stream is readable (or hung up) or `timeout` elapses.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        Ok(poll::poll_one(self.as_raw_fd(), Interest::Readable, timeout)?.is_some())
    }

    /// `"unix"` or `"tcp"`, for logs.
    pub fn transport_name(&self) -> &'static str {
        match self.inner {
            Socket::Unix(_) => "unix",
            Socket::Tcp(_) => "tcp",
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("transport", &self.transport_name())
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_writable_and_reports_readability() {
        let (mut left, right) = IpcStream::pair().unwrap();
        assert!(left.wait_writable(Duration::from_millis(100)).unwrap());
        assert!(!right.wait_readable(Duration::from_millis(10)).unwrap());

        left.write_all(b"x").unwrap();
        assert!(right.wait_readable(Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (left, _right) = IpcStream::pair().unwrap();
        left.shutdown().unwrap();
        left.shutdown().unwrap();
    }

    #[test]
    fn cloned_handle_reads_what_peer_wrote() {
        let (mut left, right) = IpcStream::pair().unwrap();
        let mut reader = right.try_clone().unwrap();
        drop(right);

        left.write_all(b"chunk").unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"chunk");
        assert_eq!(reader.transport_name(), "unix");
    }
}
