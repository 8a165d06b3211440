use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// TCP listener for loopback or LAN endpoints.
#[derive(Debug)]
pub struct TcpSocket {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpSocket {
    /// Bind and listen on `addr` (`host:port`). Port `0` picks a free port.
    pub fn bind(addr: &str) -> Result<Self> {
        let bind_err = |source: std::io::Error| TransportError::Bind {
            endpoint: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        info!(%local, "listening on tcp socket");
        Ok(Self { listener, local })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        Ok(IpcStream::from_tcp(stream))
    }

    /// Accept one pending connection on a non-blocking listener.
    pub fn try_accept(&self) -> Result<Option<IpcStream>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                debug!(%peer, "accepted connection");
                Ok(Some(IpcStream::from_tcp(stream)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking).map_err(Into::into)
    }

    /// Connect to `addr`, trying each resolved address within `timeout`.
    pub fn connect(addr: &str, timeout: Duration) -> Result<IpcStream> {
        let connect_err = |source: std::io::Error| TransportError::Connect {
            endpoint: addr.to_string(),
            source,
        };
        let mut last_err = None;
        for candidate in addr.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%candidate, "connected to tcp socket");
                    return Ok(IpcStream::from_tcp(stream));
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(connect_err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            )
        })))
    }

    /// Address actually bound, including an OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl AsRawFd for TcpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}
