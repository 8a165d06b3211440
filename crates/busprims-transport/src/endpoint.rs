//! Endpoint addresses.
//!
//! Two schemes are understood:
//! - `ipc:///path/to.sock`: a filesystem Unix domain socket
//! - `tcp://host:port`: a TCP socket; `*` as host binds every interface

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TransportError};

const IPC_SCHEME: &str = "ipc://";
const TCP_SCHEME: &str = "tcp://";

/// A parsed bus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ipc(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse a full endpoint string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some(path) = input.strip_prefix(IPC_SCHEME) {
            if path.is_empty() {
                return Err(invalid(input, "missing socket path"));
            }
            return Ok(Endpoint::Ipc(PathBuf::from(path)));
        }

        if let Some(rest) = input.strip_prefix(TCP_SCHEME) {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| invalid(input, "missing port"))?;
            if host.is_empty() {
                return Err(invalid(input, "missing host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid(input, "port is not a number in 0..=65535"))?;
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        Err(invalid(input, "unsupported scheme (expected ipc:// or tcp://)"))
    }

    /// Build an endpoint from an address and port pair.
    ///
    /// A port of `0` means `address` is already a full endpoint string.
    /// Otherwise `address` names a TCP host, with or without the `tcp://`
    /// prefix.
    pub fn from_parts(address: &str, port: u16) -> Result<Self> {
        if port == 0 {
            return Self::parse(address);
        }

        let host = address.trim();
        let host = host.strip_prefix(TCP_SCHEME).unwrap_or(host);
        if host.is_empty() {
            return Err(invalid(address, "missing host"));
        }
        if host.contains("://") {
            return Err(invalid(address, "a port can only be combined with a tcp host"));
        }
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// TCP port, if this is a TCP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Ipc(_) => None,
            Endpoint::Tcp { port, .. } => Some(*port),
        }
    }

    /// Socket path, if this is an IPC endpoint.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Endpoint::Ipc(path) => Some(path),
            Endpoint::Tcp { .. } => None,
        }
    }

    pub fn is_ipc(&self) -> bool {
        matches!(self, Endpoint::Ipc(_))
    }

    /// `host:port` string suitable for socket address resolution.
    pub(crate) fn socket_addr_string(&self) -> Option<String> {
        match self {
            Endpoint::Ipc(_) => None,
            Endpoint::Tcp { host, port } => {
                let host = if host == "*" { "0.0.0.0" } else { host.as_str() };
                Some(format!("{host}:{port}"))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ipc(path) => write!(f, "{IPC_SCHEME}{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "{TCP_SCHEME}{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(endpoint: &str, reason: &'static str) -> TransportError {
    TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipc_endpoint() {
        let ep = Endpoint::parse("ipc:///tmp/secure_ipc").unwrap();
        assert_eq!(ep, Endpoint::Ipc(PathBuf::from("/tmp/secure_ipc")));
        assert_eq!(ep.to_string(), "ipc:///tmp/secure_ipc");
        assert_eq!(ep.port(), None);
        assert!(ep.is_ipc());
    }

    #[test]
    fn parses_tcp_endpoint() {
        let ep: Endpoint = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(ep.port(), Some(5555));
        assert_eq!(ep.socket_addr_string().as_deref(), Some("127.0.0.1:5555"));
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn wildcard_host_binds_all_interfaces() {
        let ep = Endpoint::parse("tcp://*:7000").unwrap();
        assert_eq!(ep.socket_addr_string().as_deref(), Some("0.0.0.0:7000"));
    }

    #[test]
    fn rejects_malformed_endpoints() {
        for bad in ["", "ipc://", "tcp://", "tcp://host", "tcp://:80", "tcp://h:99999", "udp://x:1"] {
            assert!(
                matches!(Endpoint::parse(bad), Err(TransportError::InvalidEndpoint { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn from_parts_with_zero_port_parses_full_endpoint() {
        let ep = Endpoint::from_parts("ipc:///tmp/bus.sock", 0).unwrap();
        assert_eq!(ep.path(), Some(Path::new("/tmp/bus.sock")));
    }

    #[test]
    fn from_parts_combines_host_and_port() {
        assert_eq!(
            Endpoint::from_parts("tcp://localhost", 9000).unwrap(),
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 9000
            }
        );
        assert_eq!(Endpoint::from_parts("10.0.0.1", 1).unwrap().port(), Some(1));
        assert!(Endpoint::from_parts("ipc:///tmp/x", 5).is_err());
    }
}
