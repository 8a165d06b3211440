use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use busprims_core::{BusError, Disposition, ErrorCode, ErrorHandler, RecoveryPlan, SlotPool};
use busprims_frame::{
    read_body, write_envelope, Envelope, Frame, FrameConfig, FrameError, FrameReader, FrameWriter,
    HEADER_SIZE,
};
use busprims_transport::{
    connect, Endpoint, IpcStream, SocketOption, SocketOptionKind, SocketOptions, TransportError,
};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, RouterError};
use crate::traits::Transmitter;

/// Default bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default send buffer pool capacity.
pub const DEFAULT_SEND_BUFFERS: usize = 10;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for a [`FrameTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default: 5s.
    pub connect_timeout: Duration,
    /// Bound on one poll in [`Transmitter::worker`]. Default: 500ms.
    pub poll_interval: Duration,
    pub frame: FrameConfig,
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: crate::router_socket::DEFAULT_POLL_INTERVAL,
            frame: FrameConfig::default(),
        }
    }
}

/// Connection lifecycle of a [`FrameTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client transport: one connection to a receiver, with a fixed pool of `N`
/// send buffers.
///
/// Every send writes `[identity][empty][chunks...]`; replies from the
/// receiver arrive as `[empty][chunks...]`.
pub struct FrameTransport<const N: usize = DEFAULT_SEND_BUFFERS> {
    config: TransportConfig,
    options: Mutex<SocketOptions>,
    state: Mutex<ConnectionState>,
    endpoint: Mutex<Option<Endpoint>>,
    writer: Mutex<Option<FrameWriter<IpcStream>>>,
    reader: Mutex<Option<FrameReader<IpcStream>>>,
    pool: Arc<SlotPool<BytesMut, N>>,
    handler: ErrorHandler,
}

impl<const N: usize> FrameTransport<N> {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        let frame_size = HEADER_SIZE + config.frame.chunk_size;
        let pool = Arc::new(SlotPool::with_hooks(
            move |buf: &mut BytesMut| buf.reserve(frame_size),
            |buf: &mut BytesMut| buf.clear(),
        ));
        let handler = ErrorHandler::new(Self::recovery_plan(&pool));
        Self {
            config,
            options: Mutex::new(SocketOptions::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            endpoint: Mutex::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pool,
            handler,
        }
    }

    /// Transport announcing `identity` on connect and in every envelope.
    pub fn with_identity(identity: impl Into<Bytes>) -> Result<Self> {
        let transport = Self::new();
        transport.set_sockopt(SocketOption::Identity(identity.into()))?;
        Ok(transport)
    }

    fn recovery_plan(pool: &Arc<SlotPool<BytesMut, N>>) -> RecoveryPlan {
        let pool = Arc::clone(pool);
        RecoveryPlan::builder()
            .on(ErrorCode::Connect, || {
                warn!("trying to resolve connect failure; caller must reconnect");
                false
            })
            .on(ErrorCode::BufferFull, move || match pool.check_integrity() {
                Ok(()) => {
                    debug!(in_use = pool.len(), "send buffers intact");
                    true
                }
                Err(err) => {
                    warn!(error = %err, "send buffer pool failed integrity check");
                    false
                }
            })
            .build()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint of the live connection.
    pub fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.endpoint).clone()
    }

    /// Send buffers currently lent out.
    pub fn buffers_in_use(&self) -> usize {
        self.pool.len()
    }

    pub const fn buffer_capacity(&self) -> usize {
        N
    }

    /// Receive one reply, waiting up to `timeout` for it to start.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn recv_envelope(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let mut guard = lock(&self.reader);
        let Some(reader) = guard.as_mut() else {
            return Err(RouterError::NotConnected);
        };

        if reader.buffered() == 0 && !reader.get_ref().wait_readable(timeout)? {
            return Ok(None);
        }

        let deadline = Instant::now() + self.config.frame.multipart_timeout;
        match read_body(reader, deadline) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(FrameError::Timeout) => Ok(None),
            Err(err) => {
                let fatal = err.is_fatal_to_stream();
                if fatal {
                    guard.take();
                }
                drop(guard);
                let err = RouterError::from(err);
                if fatal {
                    self.teardown();
                }
                Err(err)
            }
        }
    }

    /// Receive one reply body, reassembled.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        Ok(self
            .recv_envelope(timeout)?
            .map(|envelope| envelope.reassemble()))
    }

    fn establish(&self, endpoint: &Endpoint) -> Result<(FrameReader<IpcStream>, FrameWriter<IpcStream>)> {
        let timeout = self.config.connect_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || TransportError::Timeout {
            endpoint: endpoint.to_string(),
            after: timeout,
        };

        let stream = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match connect(endpoint, remaining) {
                Ok(stream) => break stream,
                Err(TransportError::Connect { source, .. }) if is_retryable(&source) => {
                    if remaining <= CONNECT_RETRY_INTERVAL {
                        return Err(timed_out().into());
                    }
                    trace!(%endpoint, error = %source, "receiver not ready, retrying");
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !stream.wait_writable(remaining)? {
            return Err(timed_out().into());
        }

        let (identity, recv_timeout, send_timeout) = {
            let options = lock(&self.options);
            (
                options.identity().cloned().unwrap_or_default(),
                options.recv_timeout().or(self.config.frame.read_timeout),
                options.send_timeout().or(self.config.frame.write_timeout),
            )
        };
        let frame = self
            .config
            .frame
            .clone()
            .with_read_timeout(recv_timeout)
            .with_write_timeout(send_timeout);

        let reader = FrameReader::with_config_ipc(stream.try_clone()?, frame.clone())?;
        let mut writer = FrameWriter::with_config_ipc(stream, frame)?;
        writer.write_frame(&Frame::greeting(identity))?;
        Ok((reader, writer))
    }

    fn teardown(&self) {
        *lock(&self.state) = ConnectionState::Disconnected;
        if let Some(writer) = lock(&self.writer).take() {
            if let Err(err) = writer.get_ref().shutdown() {
                trace!(error = %err, "shutdown during teardown");
            }
        }
        lock(&self.reader).take();
        lock(&self.endpoint).take();
    }

    fn report(&self, err: &RouterError) -> Disposition {
        self.handler.handle(&BusError::from_classified(err))
    }

    fn fail(&self, err: RouterError) -> Result<()> {
        self.report(&err);
        Err(err)
    }
}

impl<const N: usize> Transmitter for FrameTransport<N> {
    fn connect(&self, address: &str, port: u16) -> Result<()> {
        let endpoint = match Endpoint::from_parts(address, port) {
            Ok(endpoint) => endpoint,
            Err(err) => return self.fail(err.into()),
        };

        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Disconnected {
                return Err(RouterError::AlreadyConnected(endpoint.to_string()));
            }
            *state = ConnectionState::Connecting;
        }

        match self.establish(&endpoint) {
            Ok((reader, writer)) => {
                *lock(&self.writer) = Some(writer);
                *lock(&self.reader) = Some(reader);
                *lock(&self.endpoint) = Some(endpoint.clone());
                *lock(&self.state) = ConnectionState::Connected;
                info!(%endpoint, "transmitter connected");
                Ok(())
            }
            Err(err) => {
                *lock(&self.state) = ConnectionState::Disconnected;
                self.fail(err)
            }
        }
    }

    fn disconnect(&self, address: &str, port: u16) -> Result<()> {
        let endpoint = Endpoint::from_parts(address, port)?;
        if self.state() != ConnectionState::Connected
            || lock(&self.endpoint).as_ref() != Some(&endpoint)
        {
            return Err(RouterError::NotConnected);
        }
        self.teardown();
        info!(%endpoint, "transmitter disconnected");
        Ok(())
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let identity = lock(&self.options).identity().cloned();
        let Some(identity) = identity.filter(|identity| !identity.is_empty()) else {
            return self.fail(RouterError::MissingIdentity);
        };
        if !self.is_connected() {
            return self.fail(RouterError::NotConnected);
        }

        let Some(mut slot) = self.pool.acquire() else {
            let err = RouterError::BufferFull { capacity: N };
            self.report(&err);
            // Exhaustion is only logged; check the pool is sound before dropping the send.
            self.handler.plan().execute(ErrorCode::BufferFull);
            return Err(err);
        };
        slot.clear();

        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            drop(guard);
            return self.fail(RouterError::NotConnected);
        };

        match write_envelope(
            writer.get_mut(),
            &mut slot,
            &identity,
            data,
            self.config.frame.chunk_size,
        ) {
            Ok(chunks) => {
                trace!(bytes = data.len(), chunks, "envelope sent");
                Ok(())
            }
            Err(err) => {
                drop(guard);
                drop(slot);
                let err = RouterError::from(err);
                self.report(&err);
                if err.is_fatal_to_stream() {
                    self.teardown();
                }
                Err(err)
            }
        }
    }

    fn set_sockopt(&self, option: SocketOption) -> Result<()> {
        lock(&self.options).set(option)?;
        Ok(())
    }

    fn get_sockopt(&self, kind: SocketOptionKind) -> Option<SocketOption> {
        lock(&self.options).get(kind).cloned()
    }

    fn worker(
        &self,
        running: &AtomicBool,
        mut handler: Option<&mut dyn FnMut(Envelope)>,
    ) -> Result<()> {
        let drain = handler.is_none();
        let mut timeout = self.config.poll_interval;
        while running.load(Ordering::Acquire) {
            match self.recv_envelope(timeout) {
                Ok(Some(envelope)) => match handler.as_mut() {
                    Some(handler) => handler(envelope),
                    None => trace!(bytes = envelope.body_len(), "discarding reply"),
                },
                Ok(None) => {
                    if drain {
                        break;
                    }
                }
                Err(err) => {
                    self.report(&err);
                    return Err(err);
                }
            }
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

impl<const N: usize> Default for FrameTransport<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for FrameTransport<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTransport")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .field("buffers_in_use", &self.pool.len())
            .field("buffer_capacity", &N)
            .finish()
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use busprims_core::MESSAGE_SIZE;
    use busprims_frame::{read_envelope, write_body};
    use busprims_transport::Listener;

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "busprims-transport-{}-{}-{}",
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

    fn address(endpoint: &Endpoint) -> String {
        endpoint.to_string()
    }

    #[test]
    fn send_round_trips_through_raw_listener() {
        let dir = scratch_dir("roundtrip");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let listener = Listener::bind(&endpoint).unwrap();

        let server = thread::spawn(move || {
            let stream = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = FrameReader::new(stream);

            let greeting = reader.read_frame().unwrap();
            assert!(greeting.is_greeting());
            assert_eq!(greeting.payload.as_ref(), b"uixxxxx");

            let envelope = read_envelope(&mut reader, Instant::now() + Duration::from_secs(5)).unwrap();
            assert_eq!(envelope.identity().as_ref(), b"uixxxxx");
            let body = envelope.reassemble();
            assert_eq!(body.len(), 1000);

            let mut scratch = BytesMut::new();
            write_body(&mut writer, &mut scratch, &body, MESSAGE_SIZE).unwrap();
        });

        let client: FrameTransport = FrameTransport::with_identity("uixxxxx").unwrap();
        client.connect(&address(&endpoint), 0).unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let payload: Vec<u8> = (0..1000).map(|i| (i % 7) as u8).collect();
        client.send(&payload).unwrap();
        assert_eq!(client.buffers_in_use(), 0);

        let reply = client.recv(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(reply.as_ref(), payload.as_slice());
        server.join().expect("server thread should finish");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn send_requires_identity_and_connection() {
        let client: FrameTransport = FrameTransport::new();
        assert!(matches!(
            client.send(b"x").unwrap_err(),
            RouterError::MissingIdentity
        ));

        client
            .set_sockopt(SocketOption::Identity(Bytes::from_static(b"manager")))
            .unwrap();
        assert!(matches!(
            client.send(b"x").unwrap_err(),
            RouterError::NotConnected
        ));
    }

    #[test]
    fn identity_option_is_validated() {
        let client: FrameTransport = FrameTransport::new();
        assert!(client
            .set_sockopt(SocketOption::Identity(Bytes::new()))
            .is_err());
        assert_eq!(client.get_sockopt(SocketOptionKind::Identity), None);
    }

    #[test]
    fn exhausted_pool_fails_fast_with_buffer_full() {
        let dir = scratch_dir("full");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let _listener = Listener::bind(&endpoint).unwrap();

        let client = FrameTransport::<0>::with_identity("peerxxx").unwrap();
        client.connect(&address(&endpoint), 0).unwrap();

        let err = client.send(b"dropped").unwrap_err();
        assert!(matches!(err, RouterError::BufferFull { capacity: 0 }));
        assert!(client.is_connected());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_times_out_without_receiver() {
        let dir = scratch_dir("timeout");
        let endpoint = Endpoint::Ipc(dir.join("absent.sock"));
        let client: FrameTransport = FrameTransport::with_config(
            TransportConfig::default().with_connect_timeout(Duration::from_millis(200)),
        );

        let started = Instant::now();
        let err = client.connect(&address(&endpoint), 0).unwrap_err();
        assert!(matches!(
            err,
            RouterError::Transport(TransportError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn double_connect_and_double_disconnect_are_rejected() {
        let dir = scratch_dir("twice");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let _listener = Listener::bind(&endpoint).unwrap();
        let client: FrameTransport = FrameTransport::new();
        let addr = address(&endpoint);

        client.connect(&addr, 0).unwrap();
        assert!(matches!(
            client.connect(&addr, 0).unwrap_err(),
            RouterError::AlreadyConnected(_)
        ));

        client.disconnect(&addr, 0).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.disconnect(&addr, 0).unwrap_err(),
            RouterError::NotConnected
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drain_worker_discards_replies_and_stops() {
        let dir = scratch_dir("drain");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let listener = Listener::bind(&endpoint).unwrap();

        let client: FrameTransport = FrameTransport::with_identity("manager").unwrap();
        client.connect(&address(&endpoint), 0).unwrap();

        let mut server = listener.accept().unwrap();
        let mut scratch = BytesMut::new();
        write_body(&mut server, &mut scratch, b"one", MESSAGE_SIZE).unwrap();
        write_body(&mut server, &mut scratch, b"two", MESSAGE_SIZE).unwrap();

        let running = AtomicBool::new(true);
        client.worker(&running, None).unwrap();
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(client.recv(Duration::from_millis(50)).unwrap(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn worker_hands_replies_to_callback() {
        let dir = scratch_dir("callback");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let listener = Listener::bind(&endpoint).unwrap();

        let client: FrameTransport = FrameTransport::with_identity("manager").unwrap();
        client.connect(&address(&endpoint), 0).unwrap();

        let mut server = listener.accept().unwrap();
        let mut scratch = BytesMut::new();
        write_body(&mut server, &mut scratch, b"hello", MESSAGE_SIZE).unwrap();

        let running = AtomicBool::new(true);
        let mut received = Vec::new();
        let mut callback = |envelope: Envelope| {
            received.push(envelope.reassemble());
            running.store(false, Ordering::Release);
        };
        client.worker(&running, Some(&mut callback)).unwrap();
        assert_eq!(received, vec![Bytes::from_static(b"hello")]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn worker_stops_within_one_poll_interval_of_cancel() {
        let dir = scratch_dir("worker-cancel");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let _listener = Listener::bind(&endpoint).unwrap();

        let poll_interval = Duration::from_millis(200);
        let client: FrameTransport =
            FrameTransport::with_config(TransportConfig::default().with_poll_interval(poll_interval));
        client
            .set_sockopt(SocketOption::Identity(Bytes::from_static(b"uixxxxx")))
            .unwrap();
        client.connect(&address(&endpoint), 0).unwrap();

        let running = AtomicBool::new(true);
        let mut callback = |_: Envelope| panic!("nothing is ever sent");
        let stopped_after = std::thread::scope(|scope| {
            let canceller = scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(150));
                running.store(false, Ordering::Release);
                Instant::now()
            });
            client.worker(&running, Some(&mut callback)).unwrap();
            let returned = Instant::now();
            returned.saturating_duration_since(canceller.join().expect("canceller should finish"))
        });

        assert!(
            stopped_after <= poll_interval + Duration::from_millis(100),
            "worker took {stopped_after:?} after cancel"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn peer_hangup_disconnects_transport() {
        let dir = scratch_dir("hangup");
        let endpoint = Endpoint::Ipc(dir.join("bus.sock"));
        let listener = Listener::bind(&endpoint).unwrap();

        let client: FrameTransport = FrameTransport::with_identity("manager").unwrap();
        client.connect(&address(&endpoint), 0).unwrap();
        drop(listener.accept().unwrap());

        let err = client.recv(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            RouterError::Frame(FrameError::ConnectionClosed)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
