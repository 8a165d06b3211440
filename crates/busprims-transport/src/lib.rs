//! Bus transport layer.
//!
//! Provides a unified stream interface over the two endpoint schemes the bus
//! understands:
//! - `ipc://` Unix domain sockets
//! - `tcp://` TCP sockets (loopback or LAN)
//!
//! This is the lowest layer of busprims. Everything else builds on top of
//! the [`IpcStream`] type and the [`Listener`] provided here, plus
//! [`poll`] readiness waits and the [`SocketOptions`] store.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod options;
pub mod poll;
pub mod tcp;
pub mod traits;
pub mod uds;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::{connect, Listener};
pub use options::{validate_identity, SocketOption, SocketOptionKind, SocketOptions, MAX_IDENTITY_LEN};
pub use poll::{poll_many, poll_one, Interest, PollEntry, Readiness};
pub use tcp::TcpSocket;
pub use traits::IpcStream;
pub use uds::UnixDomainSocket;
