//! Connection identity, lifetime notifications, and the connection registry.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Expose heartbeat / shutdown-requested / closed / abort subscription points
//! - Track every live connection so management code can enumerate and close it
//!
//! # Design Decisions
//! - The registry is an id-keyed concurrent table, not a web of references
//! - One-shot signals run late subscribers immediately, so registration order
//!   relative to firing never loses a notification
//! - Callbacks always run outside the signal's lock

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection ended or is being asked to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEndReason {
    KeepAliveTimeout,
    RequestHeadersTimeout,
    MinRequestBodyDataRate,
    MinResponseDataRate,
    ServerTimeout,
    GracefulAppShutdown,
    AppShutdownTimeout,
    EndpointRemoved,
    TlsHandshakeFailed,
    TransportCompleted,
    AbortedByApp,
}

impl ConnectionEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionEndReason::KeepAliveTimeout => "keep_alive_timeout",
            ConnectionEndReason::RequestHeadersTimeout => "request_headers_timeout",
            ConnectionEndReason::MinRequestBodyDataRate => "min_request_body_data_rate",
            ConnectionEndReason::MinResponseDataRate => "min_response_data_rate",
            ConnectionEndReason::ServerTimeout => "server_timeout",
            ConnectionEndReason::GracefulAppShutdown => "graceful_app_shutdown",
            ConnectionEndReason::AppShutdownTimeout => "app_shutdown_timeout",
            ConnectionEndReason::EndpointRemoved => "endpoint_removed",
            ConnectionEndReason::TlsHandshakeFailed => "tls_handshake_failed",
            ConnectionEndReason::TransportCompleted => "transport_completed",
            ConnectionEndReason::AbortedByApp => "aborted_by_app",
        }
    }
}

impl fmt::Display for ConnectionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte stream a request processor can own.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// A transport that carries independent streams itself (e.g. QUIC).
///
/// The stream-level machinery lives in the transport implementation; this
/// crate only needs to know the connection is multiplexed.
pub trait MultiplexedTransport: Send + Sync + 'static {
    fn protocol_name(&self) -> &str;
}

/// What an accepted connection carries.
pub enum Transport {
    Stream(BoxedIo),
    Multiplexed(Arc<dyn MultiplexedTransport>),
}

impl Transport {
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Transport::Multiplexed(_))
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream(_) => f.write_str("Transport::Stream"),
            Transport::Multiplexed(t) => write!(f, "Transport::Multiplexed({})", t.protocol_name()),
        }
    }
}

/// Peer or local address of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    Tcp(SocketAddr),
    Unix(Option<PathBuf>),
    Unknown,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Tcp(addr) => write!(f, "{}", addr),
            PeerAddress::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddress::Unix(None) => f.write_str("unix:(unnamed)"),
            PeerAddress::Unknown => f.write_str("unknown"),
        }
    }
}

/// A raw connection as yielded by a listener.
#[derive(Debug)]
pub struct AcceptedConnection {
    pub transport: Transport,
    pub local: PeerAddress,
    pub remote: PeerAddress,
}

/// An accepted connection after the dispatcher assigned its identity.
#[derive(Debug)]
pub struct TransportConnection {
    pub lifetime: Arc<ConnectionLifetime>,
    pub transport: Transport,
    pub local: PeerAddress,
    pub remote: PeerAddress,
}

impl TransportConnection {
    pub fn id(&self) -> ConnectionId {
        self.lifetime.id()
    }
}

enum SignalState<A> {
    Pending(Vec<Box<dyn FnOnce(A) + Send>>),
    Fired(A),
}

/// A one-shot notification with late-subscriber replay.
struct Signal<A: Clone + Send + 'static> {
    state: Mutex<SignalState<A>>,
}

impl<A: Clone + Send + 'static> Signal<A> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::Pending(Vec::new())),
        }
    }

    fn subscribe(&self, callback: Box<dyn FnOnce(A) + Send>) {
        let fired = {
            let mut state = self.state.lock().expect("signal mutex poisoned");
            match &mut *state {
                SignalState::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                SignalState::Fired(value) => value.clone(),
            }
        };
        callback(fired);
    }

    /// Fire once; returns false if already fired.
    fn fire(&self, value: A) -> bool {
        let callbacks = {
            let mut state = self.state.lock().expect("signal mutex poisoned");
            match std::mem::replace(&mut *state, SignalState::Fired(value.clone())) {
                SignalState::Pending(callbacks) => callbacks,
                SignalState::Fired(previous) => {
                    *state = SignalState::Fired(previous);
                    return false;
                }
            }
        };
        for callback in callbacks {
            callback(value.clone());
        }
        true
    }

    fn is_fired(&self) -> bool {
        matches!(
            *self.state.lock().expect("signal mutex poisoned"),
            SignalState::Fired(_)
        )
    }
}

type HeartbeatCallback = Arc<dyn Fn(Instant) + Send + Sync>;

/// Per-connection subscription points shared between the transport side and
/// the HTTP lifecycle.
pub struct ConnectionLifetime {
    id: ConnectionId,
    endpoint: Arc<str>,
    heartbeat: Mutex<Vec<HeartbeatCallback>>,
    shutdown_requested: Signal<()>,
    closed: Signal<()>,
    abort_requested: Signal<ConnectionEndReason>,
}

impl ConnectionLifetime {
    pub fn new(id: ConnectionId, endpoint: Arc<str>) -> Self {
        Self {
            id,
            endpoint,
            heartbeat: Mutex::new(Vec::new()),
            shutdown_requested: Signal::new(),
            closed: Signal::new(),
            abort_requested: Signal::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Display url of the endpoint that accepted this connection.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn on_heartbeat(&self, callback: impl Fn(Instant) + Send + Sync + 'static) {
        self.heartbeat
            .lock()
            .expect("heartbeat mutex poisoned")
            .push(Arc::new(callback));
    }

    pub fn on_shutdown_requested(&self, callback: impl FnOnce() + Send + 'static) {
        self.shutdown_requested.subscribe(Box::new(move |()| callback()));
    }

    pub fn on_closed(&self, callback: impl FnOnce() + Send + 'static) {
        self.closed.subscribe(Box::new(move |()| callback()));
    }

    pub fn on_abort_requested(&self, callback: impl FnOnce(ConnectionEndReason) + Send + 'static) {
        self.abort_requested.subscribe(Box::new(callback));
    }

    /// Deliver a heartbeat tick to every subscriber.
    pub fn tick(&self, now: Instant) {
        let callbacks: Vec<HeartbeatCallback> = self
            .heartbeat
            .lock()
            .expect("heartbeat mutex poisoned")
            .clone();
        for callback in callbacks {
            callback(now);
        }
    }

    /// Ask the connection to finish in-flight work and stop.
    pub fn request_shutdown(&self) -> bool {
        self.shutdown_requested.fire(())
    }

    /// Report that the transport has closed.
    pub fn notify_closed(&self) -> bool {
        self.closed.fire(())
    }

    /// Ask the connection to stop immediately.
    pub fn request_abort(&self, reason: ConnectionEndReason) -> bool {
        self.abort_requested.fire(reason)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.is_fired()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }
}

impl fmt::Debug for ConnectionLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifetime")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Tracks every live connection, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionLifetime>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<ConnectionLifetime>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<ConnectionLifetime>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionLifetime>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of live connections; callbacks run on the snapshot so no
    /// table shard lock is held while connection code executes.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionLifetime>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn tick_all(&self, now: Instant) {
        for connection in self.snapshot() {
            connection.tick(now);
        }
    }

    /// Request graceful shutdown of every connection. Returns how many were asked.
    pub fn request_shutdown_all(&self) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|connection| connection.request_shutdown())
            .count()
    }

    /// Request graceful shutdown of the connections accepted by one endpoint.
    pub fn request_shutdown_endpoint(&self, endpoint: &str) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|connection| connection.endpoint() == endpoint)
            .filter(|connection| connection.request_shutdown())
            .count()
    }

    pub fn abort_all(&self, reason: ConnectionEndReason) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|connection| connection.request_abort(reason))
            .count()
    }

    /// Wait until the registry is empty or the timeout elapses.
    /// Returns true if every connection closed in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        // Check periodically
        while !self.connections.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn lifetime(endpoint: &str) -> Arc<ConnectionLifetime> {
        Arc::new(ConnectionLifetime::new(ConnectionId::new(), Arc::from(endpoint)))
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn signal_fires_once_and_replays_to_late_subscribers() {
        let connection = lifetime("http://127.0.0.1:1");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        connection.on_closed(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(connection.notify_closed());
        assert!(!connection.notify_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let c = calls.clone();
        connection.on_closed(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn abort_carries_first_reason() {
        let connection = lifetime("http://127.0.0.1:1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        connection.on_abort_requested(move |reason| s.lock().unwrap().push(reason));
        connection.request_abort(ConnectionEndReason::AppShutdownTimeout);
        connection.request_abort(ConnectionEndReason::ServerTimeout);
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionEndReason::AppShutdownTimeout]);
    }

    #[test]
    fn registry_tracks_and_ticks() {
        let registry = ConnectionRegistry::new();
        let a = lifetime("http://127.0.0.1:1");
        let b = lifetime("http://127.0.0.1:2");
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        a.on_heartbeat(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.len(), 2);

        registry.tick_all(Instant::now());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        assert_eq!(registry.request_shutdown_endpoint("http://127.0.0.1:2"), 1);
        assert!(b.is_shutdown_requested());
        assert!(!a.is_shutdown_requested());

        registry.unregister(a.id());
        assert!(registry.get(a.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_drain_times_out_with_live_connections() {
        let registry = ConnectionRegistry::new();
        registry.register(lifetime("http://127.0.0.1:1"));
        assert!(!registry.wait_for_drain(Duration::from_millis(120)).await);

        let empty = ConnectionRegistry::new();
        assert!(empty.wait_for_drain(Duration::from_millis(10)).await);
    }
}
