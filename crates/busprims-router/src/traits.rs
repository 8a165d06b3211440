use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use busprims_frame::Envelope;
use busprims_transport::{Endpoint, SocketOption, SocketOptionKind};

use crate::error::Result;

/// Client side of the bus: one outbound connection to a receiver.
///
/// Methods take `&self` so one transmitter can be shared between a sending
/// thread and a thread running [`Transmitter::worker`].
pub trait Transmitter {
    /// Connect to `address`. A zero `port` means `address` is a complete
    /// endpoint (`ipc://...` or `tcp://host:port`).
    fn connect(&self, address: &str, port: u16) -> Result<()>;

    /// Tear down the connection to `address`.
    fn disconnect(&self, address: &str, port: u16) -> Result<()>;

    /// Send `data` as one envelope addressed with this transmitter's identity.
    fn send(&self, data: &[u8]) -> Result<()>;

    fn set_sockopt(&self, option: SocketOption) -> Result<()>;

    fn get_sockopt(&self, kind: SocketOptionKind) -> Option<SocketOption>;

    /// Poll for replies until `running` is cleared, passing each one to
    /// `handler`.
    ///
    /// Without a handler, pending replies are drained and discarded once and
    /// `running` is cleared before returning.
    fn worker(&self, running: &AtomicBool, handler: Option<&mut dyn FnMut(Envelope)>)
        -> Result<()>;
}

/// Server side of the bus: a listening endpoint with many connections.
pub trait Receiver {
    /// Bind the configured endpoint.
    fn listen(&mut self) -> Result<()>;

    /// Unbind and drop every connection. Closing twice is not an error.
    fn close(&mut self) -> Result<()>;

    /// Endpoint used by the next [`Receiver::listen`].
    fn set_endpoint(&mut self, endpoint: Endpoint);

    fn endpoint(&self) -> &Endpoint;

    /// Bound TCP port, if any.
    fn port(&self) -> Option<u16>;

    /// Install server-side CURVE keys.
    fn set_curve_server_options(&mut self, public_key: &str, secret_key: &str) -> Result<()>;

    fn set_sockopt(&mut self, option: SocketOption) -> Result<()>;

    fn get_sockopt(&self, kind: SocketOptionKind) -> Option<SocketOption>;

    /// Poll the endpoint until `running` is cleared, passing each complete
    /// envelope to `handler`.
    ///
    /// Without a handler, pending envelopes are drained and discarded once
    /// and `running` is cleared before returning.
    fn worker(&mut self, running: &AtomicBool, handler: Option<&mut dyn InboundHandler>)
        -> Result<()>;
}

/// Callback invoked by [`Receiver::worker`].
pub trait InboundHandler {
    /// Handle one complete envelope.
    fn on_envelope(&mut self, inbound: &mut dyn Inbound);

    /// The connection owning `identity` has gone away.
    fn on_disconnect(&mut self, identity: &[u8]) {
        let _ = identity;
    }
}

/// One received envelope plus the ability to reply through the receiver.
pub trait Inbound {
    /// Routing identity of the connection the envelope arrived on.
    fn identity(&self) -> &[u8];

    /// Next body chunk, in arrival order. `None` once the body is drained.
    fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Send `payload` to the connection owning `identity`.
    fn reply(&mut self, identity: &[u8], payload: &[u8]) -> Result<()>;
}
