//! The message bus: learns where each client lives and forwards messages.
//!
//! Registration is implicit. The first message seen from a `src_id` maps that
//! client to the identity of the connection it arrived on, and a later message
//! from a different identity moves the mapping (last writer wins). Messages
//! whose destination has never been seen are dropped with a warning. Routes
//! are evicted when the owning connection closes, or explicitly through
//! [`Bus::evict`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use busprims_core::{
    client_name, BusError, ClientId, ErrorHandler, KeyProvider, Message, SlotPool,
    DEFAULT_ENDPOINT, MESSAGE_SIZE,
};
use busprims_transport::Endpoint;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RouterError};
use crate::router_socket::{RouterConfig, RouterSocket};
use crate::routing::{Registration, RoutingTable};
use crate::traits::{Inbound, InboundHandler, Receiver};

/// Default forwarding buffer pool capacity.
pub const DEFAULT_FORWARD_BUFFERS: usize = 10;

/// Configuration for a bus over a [`RouterSocket`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Default: `ipc:///tmp/secure_ipc`.
    pub endpoint: Endpoint,
    pub router: RouterConfig,
}

impl BusConfig {
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_router_config(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        let path = DEFAULT_ENDPOINT
            .strip_prefix("ipc://")
            .unwrap_or(DEFAULT_ENDPOINT);
        Self {
            endpoint: Endpoint::Ipc(PathBuf::from(path)),
            router: RouterConfig::default(),
        }
    }
}

/// Requests a running bus to stop. Cloneable and safe to use from another
/// thread or a signal handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    running: Arc<AtomicBool>,
}

impl CancelHandle {
    /// The bus exits within one poll interval.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }
}

/// Forwarding counters.
#[derive(Debug, Default)]
pub struct BusStats {
    forwarded: AtomicU64,
    unresolved: AtomicU64,
    bad_size: AtomicU64,
    no_buffer: AtomicU64,
    receive_failures: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    /// Dropped because the destination never registered.
    pub unresolved: u64,
    /// Dropped because the body was not exactly one message.
    pub bad_size: u64,
    pub no_buffer: u64,
    pub receive_failures: u64,
    pub send_failures: u64,
}

impl BusStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            bad_size: self.bad_size.load(Ordering::Relaxed),
            no_buffer: self.no_buffer.load(Ordering::Relaxed),
            receive_failures: self.receive_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Forwarded => &self.forwarded,
            Outcome::Unresolved => &self.unresolved,
            Outcome::BadSize => &self.bad_size,
            Outcome::NoBuffer => &self.no_buffer,
            Outcome::ReceiveFailed => &self.receive_failures,
            Outcome::SendFailed => &self.send_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Forwarded,
    Unresolved,
    BadSize,
    NoBuffer,
    ReceiveFailed,
    SendFailed,
}

/// Message bus over receiver `R`, forwarding through a pool of `N` buffers.
pub struct Bus<R = RouterSocket, const N: usize = DEFAULT_FORWARD_BUFFERS> {
    receiver: R,
    routes: Arc<RoutingTable>,
    pool: SlotPool<BytesMut, N>,
    handler: ErrorHandler,
    running: Arc<AtomicBool>,
    stats: Arc<BusStats>,
    secure: bool,
}

impl<const N: usize> Bus<RouterSocket, N> {
    /// Bus over a [`RouterSocket`] built from `config`.
    pub fn with_config(config: BusConfig) -> Self {
        Self::new(RouterSocket::with_config(config.endpoint, config.router))
    }
}

impl<R: Receiver, const N: usize> Bus<R, N> {
    pub fn new(receiver: R) -> Self {
        Self {
            receiver,
            routes: Arc::new(RoutingTable::new()),
            pool: SlotPool::with_hooks(
                |buf: &mut BytesMut| buf.reserve(MESSAGE_SIZE),
                |buf: &mut BytesMut| buf.clear(),
            ),
            handler: ErrorHandler::default(),
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(BusStats::default()),
            secure: false,
        }
    }

    /// Install server-side CURVE keys on the receiver.
    ///
    /// Rejected keys leave the bus running unsecured; returns whether the
    /// keys were installed.
    pub fn set_security(&mut self, public_key: &str, secret_key: &str) -> bool {
        match self.receiver.set_curve_server_options(public_key, secret_key) {
            Ok(()) => {
                self.secure = true;
                info!(endpoint = %self.receiver.endpoint(), "curve security enabled");
                true
            }
            Err(err) => {
                self.secure = false;
                error!(error = %err, "unsecure server: curve keys rejected");
                false
            }
        }
    }

    /// Install the router role's keypair from `keys`.
    pub fn secure_with<K: KeyProvider + ?Sized>(&mut self, keys: &K) -> bool {
        match keys.identity_keypair(ClientId::Router) {
            Ok(keypair) => self.set_security(keypair.public(), keypair.secret()),
            Err(err) => {
                warn!(error = %err, "no router keypair available");
                false
            }
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Bind the receiver and forward messages until cancelled.
    ///
    /// Cancellation sticks: a stop requested before `run` makes it return at
    /// once, and so does every later `run` until [`Bus::rearm`] is called.
    pub fn run(&mut self) -> Result<()> {
        if !self.secure {
            warn!(endpoint = %self.receiver.endpoint(), "unsecure server: no curve keys installed");
        }
        self.receiver.listen()?;
        info!(endpoint = %self.receiver.endpoint(), "bus running");

        let mut dispatch = Dispatch {
            routes: &self.routes,
            pool: &self.pool,
            handler: &self.handler,
            stats: &self.stats,
        };
        let result = self.receiver.worker(&self.running, Some(&mut dispatch));
        self.receiver.close()?;

        let stats = self.stats.snapshot();
        info!(
            forwarded = stats.forwarded,
            unresolved = stats.unresolved,
            bad_size = stats.bad_size,
            "bus stopped"
        );
        result
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Clear a previous stop request so the bus can [`run`](Bus::run) again.
    pub fn rearm(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Stop request for `sig`. Only touches an atomic flag.
    pub fn signal_handler(&self, sig: i32) {
        let _ = sig;
        self.running.store(false, Ordering::Release);
    }

    /// Forget where `client` lives.
    pub fn evict(&self, client: ClientId) -> Option<Bytes> {
        let evicted = self.routes.evict(client.as_i32());
        if evicted.is_some() {
            info!(client = %client, "route evicted");
        }
        evicted
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.routes)
    }

    pub fn stats(&self) -> Arc<BusStats> {
        Arc::clone(&self.stats)
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut R {
        &mut self.receiver
    }
}

/// Per-envelope state machine run by the receiver's worker.
struct Dispatch<'a, const N: usize> {
    routes: &'a RoutingTable,
    pool: &'a SlotPool<BytesMut, N>,
    handler: &'a ErrorHandler,
    stats: &'a BusStats,
}

impl<const N: usize> Dispatch<'_, N> {
    fn forward(&self, inbound: &mut dyn Inbound) -> Outcome {
        let Some(mut buf) = self.pool.acquire() else {
            warn!("forwarding buffers exhausted; dropping message");
            return Outcome::NoBuffer;
        };
        buf.clear();

        let mut size = 0usize;
        loop {
            match inbound.next_chunk() {
                Ok(Some(chunk)) => {
                    size += chunk.len();
                    if size <= MESSAGE_SIZE {
                        buf.extend_from_slice(&chunk);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.report(&err);
                    return Outcome::ReceiveFailed;
                }
            }
        }

        let decoded = match size {
            MESSAGE_SIZE => Message::decode(&buf[..]).ok(),
            _ => None,
        };
        let Some(message) = decoded else {
            warn!(
                size,
                expected = MESSAGE_SIZE,
                identity = %String::from_utf8_lossy(inbound.identity()),
                "discarding message with unexpected size"
            );
            return Outcome::BadSize;
        };

        let identity = Bytes::copy_from_slice(inbound.identity());
        let label = String::from_utf8_lossy(&identity).into_owned();
        match self.routes.register(message.src_id, identity) {
            Registration::New => {
                info!(client = %client_name(message.src_id), identity = %label, "client registered");
            }
            Registration::Replaced(previous) => info!(
                client = %client_name(message.src_id),
                identity = %label,
                previous = %String::from_utf8_lossy(&previous),
                "client re-registered"
            ),
            Registration::Unchanged => {}
        }

        let Some(target) = self.routes.lookup(message.dist_id) else {
            warn!(
                src = %client_name(message.src_id),
                dist = %client_name(message.dist_id),
                "destination never registered; dropping message"
            );
            return Outcome::Unresolved;
        };

        if let Err(err) = inbound.reply(&target, &buf[..]) {
            self.report(&err);
            if matches!(err, RouterError::UnknownPeer(_)) {
                self.routes.evict(message.dist_id);
            }
            return Outcome::SendFailed;
        }

        debug!(
            src = %client_name(message.src_id),
            dist = %client_name(message.dist_id),
            "message forwarded"
        );
        Outcome::Forwarded
    }

    fn report(&self, err: &RouterError) {
        self.handler.handle(&BusError::from_classified(err));
    }
}

impl<const N: usize> InboundHandler for Dispatch<'_, N> {
    fn on_envelope(&mut self, inbound: &mut dyn Inbound) {
        let outcome = self.forward(inbound);
        self.stats.record(outcome);
    }

    fn on_disconnect(&mut self, identity: &[u8]) {
        for client in self.routes.evict_identity(identity) {
            info!(client = %client_name(client), "route evicted after disconnect");
        }
    }
}
