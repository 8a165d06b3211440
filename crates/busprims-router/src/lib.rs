//! Routing layer for busprims.
//!
//! Two sides of the same wire protocol:
//! - [`FrameTransport`] is the client side. It greets with its identity and
//!   sends each message as a chunked envelope.
//! - [`RouterSocket`] is the server side. It accepts many clients, learns
//!   their identities from the greeting and can reply to any of them.
//!
//! [`Bus`] sits on a [`Receiver`], learns which identity each logical client
//! lives on and forwards messages between them. The seams are the
//! [`Transmitter`] and [`Receiver`] traits, so the bus can run over any
//! receiver that delivers envelopes.

pub mod bus;
pub mod error;
pub mod router_socket;
pub mod routing;
pub mod traits;
pub mod transport;

pub use bus::{Bus, BusConfig, BusStats, CancelHandle, StatsSnapshot, DEFAULT_FORWARD_BUFFERS};
pub use error::{Result, RouterError};
pub use router_socket::{
    RouterConfig, RouterSocket, DEFAULT_GREETING_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
pub use routing::{Registration, Route, RoutingTable};
pub use traits::{Inbound, InboundHandler, Receiver, Transmitter};
pub use transport::{
    ConnectionState, FrameTransport, TransportConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_SEND_BUFFERS,
};
