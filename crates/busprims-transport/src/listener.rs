//! Endpoint-level listen and connect, dispatching to the Unix or TCP socket.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::tcp::TcpSocket;
use crate::traits::IpcStream;
use crate::uds::UnixDomainSocket;

/// A bound listener for either endpoint scheme.
#[derive(Debug)]
pub enum Listener {
    Unix(UnixDomainSocket),
    Tcp(TcpSocket),
}

impl Listener {
    /// Bind and listen on `endpoint`.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Ipc(path) => UnixDomainSocket::bind(path).map(Listener::Unix),
            Endpoint::Tcp { .. } => {
                let addr = tcp_addr(endpoint)?;
                TcpSocket::bind(&addr).map(Listener::Tcp)
            }
        }
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        match self {
            Listener::Unix(socket) => socket.accept(),
            Listener::Tcp(socket) => socket.accept(),
        }
    }

    /// Accept one pending connection on a non-blocking listener.
    pub fn try_accept(&self) -> Result<Option<IpcStream>> {
        match self {
            Listener::Unix(socket) => socket.try_accept(),
            Listener::Tcp(socket) => socket.try_accept(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Listener::Unix(socket) => socket.set_nonblocking(nonblocking),
            Listener::Tcp(socket) => socket.set_nonblocking(nonblocking),
        }
    }

    /// The endpoint actually bound. For TCP this carries the OS-assigned port
    /// when port `0` was requested.
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            Listener::Unix(socket) => Endpoint::Ipc(socket.path().to_path_buf()),
            Listener::Tcp(socket) => {
                let addr = socket.local_addr();
                Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                }
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Listener::Unix(_) => None,
            Listener::Tcp(socket) => Some(socket.local_addr().port()),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Unix(socket) => socket.as_raw_fd(),
            Listener::Tcp(socket) => socket.as_raw_fd(),
        }
    }
}

/// Open one connection to `endpoint`. `timeout` bounds the TCP handshake;
/// Unix connects complete or fail immediately.
pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<IpcStream> {
    match endpoint {
        Endpoint::Ipc(path) => UnixDomainSocket::connect(path),
        Endpoint::Tcp { .. } => TcpSocket::connect(&tcp_addr(endpoint)?, timeout),
    }
}

fn tcp_addr(endpoint: &Endpoint) -> Result<String> {
    endpoint
        .socket_addr_string()
        .ok_or_else(|| TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "not a tcp endpoint",
        })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn tcp_listener_reports_assigned_port() {
        let listener = Listener::bind(&Endpoint::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        let port = listener.port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(listener.local_endpoint().port(), Some(port));
    }

    #[test]
    fn connect_through_endpoint_over_unix_socket() {
        let dir = std::env::temp_dir().join(format!("busprims-listener-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = Endpoint::Ipc(dir.join("ep.sock"));

        let listener = Listener::bind(&endpoint).unwrap();
        assert_eq!(listener.local_endpoint(), endpoint);
        assert_eq!(listener.port(), None);

        let mut client = connect(&endpoint, Duration::from_secs(1)).unwrap();
        client.write_all(b"ep").unwrap();
        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ep");

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
