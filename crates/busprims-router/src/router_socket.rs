//! Server-side receiver that routes replies by connection identity.
//!
//! Every connection must open with a greeting frame announcing its identity
//! (an empty greeting gets a generated `peer-N` identity). Envelopes are then
//! reassembled from whatever each readiness event delivers and handed to an
//! [`InboundHandler`] once complete; a connection is never waited on. One that
//! misses its greeting deadline, or stalls mid-envelope past the multipart
//! timeout, is dropped. Replies go out as a body (`[empty][chunks]`) on the
//! connection that currently owns the target identity; a newer connection
//! announcing an identity takes it over from an older one.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use busprims_core::{BusError, Disposition, ErrorCode, ErrorHandler, RecoveryPlan, MESSAGE_SIZE};
use busprims_frame::{
    write_body, Envelope, EnvelopeAssembler, Frame, FrameConfig, FrameError, FrameReader,
    HEADER_SIZE,
};
use busprims_transport::{
    poll_many, validate_identity, Endpoint, Interest, IpcStream, Listener, PollEntry,
    SocketOption, SocketOptionKind, SocketOptions,
};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, RouterError};
use crate::traits::{Inbound, InboundHandler, Receiver};

/// Default bound on one readiness poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time a new connection has to send its greeting after it is
/// accepted.
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_REPLY_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for a [`RouterSocket`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on one poll; also the cancellation latency. Default: 500ms.
    pub poll_interval: Duration,
    /// Default: 1s.
    pub greeting_timeout: Duration,
    /// Framing limits for every connection. Replies are written with a 2s
    /// write timeout by default.
    pub frame: FrameConfig,
}

impl RouterConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_greeting_timeout(mut self, greeting_timeout: Duration) -> Self {
        self.greeting_timeout = greeting_timeout;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            greeting_timeout: DEFAULT_GREETING_TIMEOUT,
            frame: FrameConfig::default().with_write_timeout(Some(DEFAULT_REPLY_WRITE_TIMEOUT)),
        }
    }
}

struct Connection {
    id: u64,
    identity: Option<Bytes>,
    reader: FrameReader<IpcStream>,
    writer: IpcStream,
    scratch: BytesMut,
    assembler: EnvelopeAssembler,
    /// When the greeting or the envelope in progress must be complete.
    deadline: Option<Instant>,
}

impl Connection {
    fn mid_envelope(&self) -> bool {
        !self.assembler.is_idle() || self.reader.buffered() > 0
    }
}

/// Listening endpoint that accepts many connections and routes by identity.
pub struct RouterSocket {
    endpoint: Endpoint,
    config: RouterConfig,
    options: SocketOptions,
    listener: Option<Listener>,
    connections: Vec<Connection>,
    routes: HashMap<Bytes, u64>,
    next_connection: u64,
    next_anonymous: u64,
    handler: ErrorHandler,
}

impl RouterSocket {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, RouterConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: RouterConfig) -> Self {
        let handler = ErrorHandler::new(Self::recovery_plan(&endpoint));
        Self {
            endpoint,
            config,
            options: SocketOptions::new(),
            listener: None,
            connections: Vec::new(),
            routes: HashMap::new(),
            next_connection: 0,
            next_anonymous: 0,
            handler,
        }
    }

    fn recovery_plan(endpoint: &Endpoint) -> RecoveryPlan {
        let context = endpoint.to_string();
        RecoveryPlan::builder()
            .on(ErrorCode::Bind, move || {
                warn!(
                    endpoint = %context,
                    "cannot bind receiver; another bus may own the endpoint or its directory is not writable"
                );
                false
            })
            .build()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// The endpoint actually bound, while listening.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.listener.as_ref().map(Listener::local_endpoint)
    }

    /// Open connections, greeted or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a live connection currently owns `identity`.
    pub fn is_routable(&self, identity: &[u8]) -> bool {
        self.routes.contains_key(identity)
    }

    fn report(&self, err: &RouterError) -> Disposition {
        self.handler.handle(&BusError::from_classified(err))
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.connections.iter().position(|conn| conn.id == id)
    }

    fn accept_pending(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.try_accept(),
                None => return,
            };
            match accepted {
                Ok(Some(stream)) => {
                    if let Err(err) = self.add_connection(stream) {
                        self.report(&err);
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    self.report(&err.into());
                    return;
                }
            }
        }
    }

    fn add_connection(&mut self, stream: IpcStream) -> Result<()> {
        stream.set_write_timeout(self.config.frame.write_timeout)?;
        let writer = stream.try_clone()?;
        let reader = FrameReader::with_config_ipc(stream, self.config.frame.clone())?;
        let assembler = EnvelopeAssembler::envelope(self.config.frame.max_envelope_size);

        self.next_connection += 1;
        let id = self.next_connection;
        debug!(connection = id, transport = writer.transport_name(), "accepted connection");
        self.connections.push(Connection {
            id,
            identity: None,
            reader,
            writer,
            scratch: BytesMut::with_capacity(HEADER_SIZE + MESSAGE_SIZE),
            assembler,
            deadline: Some(Instant::now() + self.config.greeting_timeout),
        });
        Ok(())
    }

    /// Route the identity announced by `frame` to connection `index`.
    fn greet(&mut self, index: usize, frame: Frame) -> Result<()> {
        if !frame.is_greeting() {
            return Err(FrameError::MalformedEnvelope("expected greeting").into());
        }

        let identity = if frame.payload.is_empty() {
            self.next_anonymous += 1;
            Bytes::from(format!("peer-{}", self.next_anonymous))
        } else {
            validate_identity(&frame.payload)?;
            frame.payload
        };

        let conn = &mut self.connections[index];
        let id = conn.id;
        conn.identity = Some(identity.clone());
        conn.deadline = None;
        let label = String::from_utf8_lossy(&identity).into_owned();
        if let Some(previous) = self.routes.insert(identity, id) {
            debug!(identity = %label, previous, connection = id, "identity handed over");
        }
        debug!(identity = %label, connection = id, "peer greeted");
        Ok(())
    }

    /// Take in what connection `id` has sent and dispatch every envelope it
    /// completes. Reads at most once, so a slow peer cannot hold the loop.
    fn service(&mut self, id: u64, handler: &mut Option<&mut dyn InboundHandler>) {
        let Some(index) = self.position(id) else {
            return;
        };
        let conn = &mut self.connections[index];
        match conn.reader.read_available() {
            Ok(()) => {}
            Err(FrameError::Io(err))
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(FrameError::ConnectionClosed) => {
                if conn.identity.is_none() {
                    debug!(connection = id, "connection closed before greeting");
                } else if conn.mid_envelope() {
                    let received = conn.assembler.received();
                    self.report(&FrameError::IncompleteEnvelope { received }.into());
                }
                self.drop_connection(index, handler);
                return;
            }
            Err(err) => {
                self.report(&err.into());
                self.drop_connection(index, handler);
                return;
            }
        }

        loop {
            let Some(index) = self.position(id) else {
                return;
            };
            let conn = &mut self.connections[index];
            let frame = match conn.reader.next_buffered() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    self.report(&err.into());
                    self.drop_connection(index, handler);
                    return;
                }
            };

            if conn.identity.is_none() {
                if let Err(err) = self.greet(index, frame) {
                    warn!(connection = id, error = %err, "dropping connection without valid greeting");
                    self.drop_connection(index, handler);
                    return;
                }
                continue;
            }

            match conn.assembler.push(frame) {
                Ok(Some(envelope)) => {
                    conn.deadline = None;
                    self.deliver(id, envelope, handler);
                }
                Ok(None) => {}
                Err(err) => {
                    self.report(&err.into());
                    self.drop_connection(index, handler);
                    return;
                }
            }
        }

        if let Some(index) = self.position(id) {
            let conn = &mut self.connections[index];
            if conn.identity.is_some() && conn.deadline.is_none() && conn.mid_envelope() {
                conn.deadline = Some(Instant::now() + self.config.frame.multipart_timeout);
            }
        }
    }

    fn deliver(&mut self, id: u64, envelope: Envelope, handler: &mut Option<&mut dyn InboundHandler>) {
        let Some(index) = self.position(id) else {
            return;
        };
        let routing_id = self.connections[index].identity.clone().unwrap_or_default();
        if envelope.identity() != &routing_id {
            trace!(
                connection = id,
                claimed = %String::from_utf8_lossy(envelope.identity()),
                "envelope identity differs from greeting; routing by greeting"
            );
        }

        let Some(sink) = handler.as_mut() else {
            trace!(connection = id, parts = envelope.parts().len(), "discarding envelope");
            return;
        };

        let (_, parts) = envelope.into_parts();
        let mut delivery = Delivery {
            routing_id,
            parts: parts.into_iter(),
            connections: &mut self.connections,
            routes: &self.routes,
            chunk_size: self.config.frame.chunk_size,
            broken: Vec::new(),
        };
        sink.on_envelope(&mut delivery);

        for broken in delivery.broken {
            if let Some(index) = self.position(broken) {
                self.drop_connection(index, handler);
            }
        }
    }

    /// Drop connections that missed their greeting or stalled mid-envelope.
    fn expire_stalled(&mut self, handler: &mut Option<&mut dyn InboundHandler>) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .connections
            .iter()
            .filter(|conn| conn.deadline.is_some_and(|deadline| deadline <= now))
            .map(|conn| conn.id)
            .collect();

        for id in expired {
            let Some(index) = self.position(id) else {
                continue;
            };
            let conn = &self.connections[index];
            if conn.identity.is_none() {
                warn!(connection = id, "dropping connection without valid greeting: timed out");
            } else {
                let received = conn.assembler.received();
                self.report(&FrameError::IncompleteEnvelope { received }.into());
            }
            self.drop_connection(index, handler);
        }
    }

    fn drop_connection(&mut self, index: usize, handler: &mut Option<&mut dyn InboundHandler>) {
        let conn = self.connections.swap_remove(index);
        if let Err(err) = conn.writer.shutdown() {
            trace!(connection = conn.id, error = %err, "shutdown after close");
        }

        let Some(identity) = conn.identity else {
            return;
        };
        if self.routes.get(&identity) != Some(&conn.id) {
            return;
        }
        self.routes.remove(&identity);
        debug!(
            identity = %String::from_utf8_lossy(&identity),
            connection = conn.id,
            "peer disconnected"
        );
        if let Some(handler) = handler {
            handler.on_disconnect(&identity);
        }
    }
}

impl Receiver for RouterSocket {
    fn listen(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }

        let bound = Listener::bind(&self.endpoint).and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        });
        match bound {
            Ok(listener) => {
                info!(
                    endpoint = %self.endpoint,
                    curve = self.options.is_curve_server(),
                    "receiver listening"
                );
                self.listener = Some(listener);
                Ok(())
            }
            Err(err) => {
                let err = RouterError::from(err);
                self.report(&err);
                Err(err)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        for conn in self.connections.drain(..) {
            if let Err(err) = conn.writer.shutdown() {
                trace!(connection = conn.id, error = %err, "shutdown on close");
            }
        }
        self.routes.clear();
        if self.listener.take().is_some() {
            info!(endpoint = %self.endpoint, "receiver closed");
        }
        Ok(())
    }

    fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.handler = ErrorHandler::new(Self::recovery_plan(&endpoint));
        self.endpoint = endpoint;
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(Listener::port)
            .or_else(|| self.endpoint.port())
    }

    fn set_curve_server_options(&mut self, public_key: &str, secret_key: &str) -> Result<()> {
        let mut options = self.options.clone();
        options.set(SocketOption::CurvePublicKey(public_key.to_string()))?;
        options.set(SocketOption::CurveSecretKey(secret_key.to_string()))?;
        options.set(SocketOption::CurveServer(true))?;
        self.options = options;
        debug!(endpoint = %self.endpoint, "curve server keys installed");
        Ok(())
    }

    fn set_sockopt(&mut self, option: SocketOption) -> Result<()> {
        self.options.set(option)?;
        Ok(())
    }

    fn get_sockopt(&self, kind: SocketOptionKind) -> Option<SocketOption> {
        self.options.get(kind).cloned()
    }

    fn worker(
        &mut self,
        running: &AtomicBool,
        mut handler: Option<&mut dyn InboundHandler>,
    ) -> Result<()> {
        let listener_fd = match &self.listener {
            Some(listener) => listener.as_raw_fd(),
            None => {
                let err = RouterError::NotListening;
                self.report(&err);
                return Err(err);
            }
        };

        let drain = handler.is_none();
        let mut timeout = self.config.poll_interval;
        let mut entries = Vec::new();
        while running.load(Ordering::Acquire) {
            entries.clear();
            entries.push(PollEntry::new(listener_fd, Interest::Readable));
            entries.extend(self.connections.iter().map(|conn| {
                PollEntry::new(conn.reader.get_ref().as_raw_fd(), Interest::Readable)
            }));

            let ready = match poll_many(&mut entries, timeout) {
                Ok(ready) => ready,
                Err(err) => {
                    let err = RouterError::from(err);
                    self.report(&err);
                    return Err(err);
                }
            };
            if ready == 0 {
                if drain {
                    break;
                }
                self.expire_stalled(&mut handler);
                continue;
            }

            let ready_ids: Vec<u64> = entries[1..]
                .iter()
                .zip(&self.connections)
                .filter(|(entry, _)| !entry.readiness.is_empty())
                .map(|(_, conn)| conn.id)
                .collect();
            if entries[0].readiness.is_readable() {
                self.accept_pending();
            }
            for id in ready_ids {
                self.service(id, &mut handler);
            }
            self.expire_stalled(&mut handler);

            if drain {
                timeout = Duration::ZERO;
            }
        }

        if drain {
            running.store(false, Ordering::Release);
        }
        Ok(())
    }
}

impl fmt::Debug for RouterSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterSocket")
            .field("endpoint", &self.endpoint)
            .field("listening", &self.listener.is_some())
            .field("connections", &self.connections.len())
            .field("routes", &self.routes.len())
            .finish()
    }
}

/// One envelope being handled, with write access to every connection.
struct Delivery<'a> {
    routing_id: Bytes,
    parts: std::vec::IntoIter<Bytes>,
    connections: &'a mut [Connection],
    routes: &'a HashMap<Bytes, u64>,
    chunk_size: usize,
    broken: Vec<u64>,
}

impl Inbound for Delivery<'_> {
    fn identity(&self) -> &[u8] {
        &self.routing_id
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.parts.next())
    }

    fn reply(&mut self, identity: &[u8], payload: &[u8]) -> Result<()> {
        let unknown = || RouterError::UnknownPeer(String::from_utf8_lossy(identity).into_owned());
        let id = *self.routes.get(identity).ok_or_else(unknown)?;
        let conn = self
            .connections
            .iter_mut()
            .find(|conn| conn.id == id)
            .ok_or_else(unknown)?;

        match write_body(&mut conn.writer, &mut conn.scratch, payload, self.chunk_size) {
            Ok(chunks) => {
                trace!(connection = id, bytes = payload.len(), chunks, "reply sent");
                Ok(())
            }
            Err(err) => {
                if err.is_fatal_to_stream() {
                    self.broken.push(id);
                }
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::path::PathBuf;
    use std::thread;

    use busprims_frame::{read_body, write_envelope, FrameFlags, FrameWriter};
    use busprims_transport::connect;

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "busprims-router-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    fn greet(stream: &IpcStream, identity: &'static [u8]) {
        let mut writer = FrameWriter::new(stream.try_clone().unwrap());
        writer.write_frame(&Frame::greeting(identity)).unwrap();
    }

    fn send(stream: &mut IpcStream, identity: &[u8], payload: &[u8]) {
        let mut scratch = BytesMut::new();
        write_envelope(stream, &mut scratch, identity, payload, MESSAGE_SIZE).unwrap();
    }

    struct Echo<'a> {
        running: &'a AtomicBool,
        seen: Vec<(Vec<u8>, Vec<u8>)>,
        disconnected: Vec<Vec<u8>>,
    }

    impl InboundHandler for Echo<'_> {
        fn on_envelope(&mut self, inbound: &mut dyn Inbound) {
            let identity = inbound.identity().to_vec();
            let mut body = Vec::new();
            while let Some(chunk) = inbound.next_chunk().unwrap() {
                body.extend_from_slice(&chunk);
            }
            inbound.reply(&identity, &body).unwrap();
            self.seen.push((identity, body));
            self.running.store(false, Ordering::Release);
        }

        fn on_disconnect(&mut self, identity: &[u8]) {
            self.disconnected.push(identity.to_vec());
        }
    }

    #[test]
    fn greeted_envelope_reaches_handler_and_reply_routes_back() {
        let dir = scratch_dir("echo");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let mut socket = RouterSocket::new(endpoint.clone());
        socket.listen().unwrap();

        let client = thread::spawn(move || {
            let mut stream = connect(&endpoint, Duration::from_secs(1)).unwrap();
            greet(&stream, b"uixxxxx");
            let payload = vec![0x33; 700];
            send(&mut stream, b"uixxxxx", &payload);

            let mut reader = FrameReader::new(stream);
            let reply = read_body(&mut reader, Instant::now() + Duration::from_secs(5)).unwrap();
            assert_eq!(reply.parts().len(), 3);
            assert_eq!(reply.reassemble().as_ref(), payload.as_slice());
        });

        let running = AtomicBool::new(true);
        let mut echo = Echo {
            running: &running,
            seen: Vec::new(),
            disconnected: Vec::new(),
        };
        socket.worker(&running, Some(&mut echo)).unwrap();
        client.join().expect("client thread should finish");

        assert_eq!(echo.seen.len(), 1);
        assert_eq!(echo.seen[0].0, b"uixxxxx");
        assert_eq!(echo.seen[0].1.len(), 700);
        assert!(socket.is_routable(b"uixxxxx"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connection_without_greeting_is_dropped() {
        let dir = scratch_dir("nogreet");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let mut socket = RouterSocket::new(endpoint.clone());
        socket.listen().unwrap();

        let mut stream = connect(&endpoint, Duration::from_secs(1)).unwrap();
        send(&mut stream, b"manager", b"no greeting");

        let running = AtomicBool::new(true);
        socket.worker(&running, None).unwrap();
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(socket.connection_count(), 0);

        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drain_mode_discards_pending_envelopes_and_stops() {
        let dir = scratch_dir("drain");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let mut socket = RouterSocket::new(endpoint.clone());
        socket.listen().unwrap();

        let mut stream = connect(&endpoint, Duration::from_secs(1)).unwrap();
        greet(&stream, b"manager");
        send(&mut stream, b"manager", b"first");
        send(&mut stream, b"manager", b"second");

        let running = AtomicBool::new(true);
        socket.worker(&running, None).unwrap();

        assert!(!running.load(Ordering::Acquire));
        assert_eq!(socket.connection_count(), 1);
        assert!(socket.is_routable(b"manager"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_greeting_gets_generated_identity() {
        let dir = scratch_dir("anon");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let mut socket = RouterSocket::new(endpoint.clone());
        socket.listen().unwrap();

        let stream = connect(&endpoint, Duration::from_secs(1)).unwrap();
        greet(&stream, b"");

        let running = AtomicBool::new(true);
        socket.worker(&running, None).unwrap();
        assert!(socket.is_routable(b"peer-1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn newer_connection_takes_over_identity() {
        let dir = scratch_dir("handover");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let mut socket = RouterSocket::new(endpoint.clone());
        socket.listen().unwrap();

        let first = connect(&endpoint, Duration::from_secs(1)).unwrap();
        greet(&first, b"peerxxx");
        let running = AtomicBool::new(true);
        socket.worker(&running, None).unwrap();

        let second = connect(&endpoint, Duration::from_secs(1)).unwrap();
        greet(&second, b"peerxxx");
        running.store(true, Ordering::Release);
        socket.worker(&running, None).unwrap();
        assert_eq!(socket.connection_count(), 2);

        // Closing the superseded connection must not unroute the identity.
        drop(first);
        running.store(true, Ordering::Release);
        socket.worker(&running, None).unwrap();
        assert_eq!(socket.connection_count(), 1);
        assert!(socket.is_routable(b"peerxxx"));

        drop(second);
        running.store(true, Ordering::Release);
        socket.worker(&running, None).unwrap();
        assert_eq!(socket.connection_count(), 0);
        assert!(!socket.is_routable(b"peerxxx"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn stall(stream: &IpcStream, identity: &'static [u8]) {
        let mut writer = FrameWriter::new(stream.try_clone().unwrap());
        writer.write_frame(&Frame::greeting(identity)).unwrap();
        writer
            .write_frame(&Frame::new(FrameFlags::MORE, Bytes::from_static(identity)))
            .unwrap();
        writer.write_frame(&Frame::new(FrameFlags::MORE, Bytes::new())).unwrap();
        writer
            .write_frame(&Frame::new(FrameFlags::MORE, Bytes::from_static(b"half a message")))
            .unwrap();
    }

    #[test]
    fn stalled_sender_does_not_hold_up_others() {
        let dir = scratch_dir("stalled");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let mut socket = RouterSocket::new(endpoint.clone());
        socket.listen().unwrap();

        let stalled = connect(&endpoint, Duration::from_secs(1)).unwrap();
        stall(&stalled, b"peerxxx");

        let client = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut stream = connect(&endpoint, Duration::from_secs(1)).unwrap();
            greet(&stream, b"uixxxxx");
            send(&mut stream, b"uixxxxx", b"prompt");
            let mut reader = FrameReader::new(stream);
            read_body(&mut reader, Instant::now() + Duration::from_secs(5)).unwrap()
        });

        let running = AtomicBool::new(true);
        let mut echo = Echo {
            running: &running,
            seen: Vec::new(),
            disconnected: Vec::new(),
        };
        let started = Instant::now();
        socket.worker(&running, Some(&mut echo)).unwrap();
        let reply = client.join().expect("client thread should finish");

        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        assert_eq!(reply.reassemble().as_ref(), b"prompt");
        assert_eq!(echo.seen, vec![(b"uixxxxx".to_vec(), b"prompt".to_vec())]);
        assert_eq!(socket.connection_count(), 2);
        drop(stalled);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stalled_envelope_and_silent_connection_expire() {
        let dir = scratch_dir("expire");
        let endpoint = Endpoint::Ipc(dir.join("router.sock"));
        let config = RouterConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_greeting_timeout(Duration::from_millis(100))
            .with_frame_config(
                FrameConfig::default().with_multipart_timeout(Duration::from_millis(100)),
            );
        let mut socket = RouterSocket::with_config(endpoint.clone(), config);
        socket.listen().unwrap();

        let mut stalled = connect(&endpoint, Duration::from_secs(1)).unwrap();
        stall(&stalled, b"peerxxx");
        let mut silent = connect(&endpoint, Duration::from_secs(1)).unwrap();

        let running = AtomicBool::new(true);
        let mut echo = Echo {
            running: &running,
            seen: Vec::new(),
            disconnected: Vec::new(),
        };
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(500));
                running.store(false, Ordering::Release);
            });
            socket.worker(&running, Some(&mut echo)).unwrap();
        });

        assert_eq!(socket.connection_count(), 0);
        assert!(echo.seen.is_empty());
        assert_eq!(echo.disconnected, vec![b"peerxxx".to_vec()]);
        for stream in [&mut stalled, &mut silent] {
            stream.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(stream.read(&mut buf).unwrap(), 0);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn worker_requires_listen() {
        let mut socket = RouterSocket::new(Endpoint::parse("tcp://127.0.0.1:0").unwrap());
        let running = AtomicBool::new(true);
        let err = socket.worker(&running, None).unwrap_err();
        assert!(matches!(err, RouterError::NotListening));
    }

    #[test]
    fn tcp_listen_reports_port_and_close_is_idempotent() {
        let mut socket = RouterSocket::new(Endpoint::parse("tcp://127.0.0.1:0").unwrap());
        assert_eq!(socket.port(), Some(0));
        socket.listen().unwrap();
        let port = socket.port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(socket.local_endpoint().and_then(|ep| ep.port()), Some(port));

        socket.close().unwrap();
        socket.close().unwrap();
        assert!(!socket.is_listening());
    }

    #[test]
    fn bind_failure_is_high_severity() {
        use busprims_core::{Classify, Severity};

        let mut socket = RouterSocket::new(Endpoint::Ipc(PathBuf::from(
            "/nonexistent-busprims-dir/router.sock",
        )));
        let err = socket.listen().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Bind);
        assert_eq!(err.severity(), Severity::High);
        assert!(!socket.is_listening());
    }

    #[test]
    fn curve_options_are_validated_together() {
        let mut socket = RouterSocket::new(Endpoint::parse("tcp://127.0.0.1:0").unwrap());
        let public: String = "P".repeat(40);
        let secret: String = "S".repeat(40);

        assert!(socket.set_curve_server_options(&public, "short").is_err());
        assert_eq!(socket.get_sockopt(SocketOptionKind::CurvePublicKey), None);

        socket.set_curve_server_options(&public, &secret).unwrap();
        assert_eq!(
            socket.get_sockopt(SocketOptionKind::CurveServer),
            Some(SocketOption::CurveServer(true))
        );
    }
}
