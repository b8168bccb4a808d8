//! Transport listeners with backpressure.
//!
//! # Responsibilities
//! - Bind TCP and unix-socket targets
//! - Yield accepted connections until unbound
//! - Enforce an optional max-concurrent-connections limit via semaphore
//! - Skip transient accept errors (peer reset before accept completed)

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::net::connection::{AcceptedConnection, PeerAddress, Transport};
use crate::net::endpoint::ListenTarget;

const LISTEN_BACKLOG: i32 = 512;

/// A source of accepted connections.
///
/// `accept` resolves to `Ok(None)` once the listener has been unbound; that is
/// the "no more connections" sentinel accept loops stop on.
pub trait ConnectionListener: Send + Sync + 'static {
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<AcceptedConnection>>>;

    /// Upper bound on useful concurrent accept loops.
    fn max_accepts(&self) -> usize;

    /// Stop accepting; pending and future `accept` calls return `Ok(None)`.
    fn unbind(&self);

    /// The target actually bound (with any OS-assigned port filled in).
    fn local_target(&self) -> ListenTarget;
}

fn default_max_accepts() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
}

/// Resolves once `unbind` has been called.
async fn unbound(mut rx: watch::Receiver<bool>) {
    // Sender lives as long as the listener; a closed channel also means unbound.
    let _ = rx.wait_for(|unbound| *unbound).await;
}

/// Listener over a tokio TCP socket.
pub struct TcpConnectionListener {
    inner: TcpListener,
    target: ListenTarget,
    unbind_tx: watch::Sender<bool>,
}

impl TcpConnectionListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl ConnectionListener for TcpConnectionListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<AcceptedConnection>>> {
        let unbind = unbound(self.unbind_tx.subscribe());
        async move {
            tokio::pin!(unbind);
            loop {
                if *self.unbind_tx.borrow() {
                    return Ok(None);
                }
                tokio::select! {
                    _ = &mut unbind => return Ok(None),
                    result = self.inner.accept() => match result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let local = stream
                                .local_addr()
                                .map(PeerAddress::Tcp)
                                .unwrap_or(PeerAddress::Unknown);
                            tracing::debug!(peer_addr = %peer, "Connection accepted");
                            return Ok(Some(AcceptedConnection {
                                transport: Transport::Stream(Box::new(stream)),
                                local,
                                remote: PeerAddress::Tcp(peer),
                            }));
                        }
                        Err(err) if is_transient(&err) => {
                            tracing::debug!(error = %err, "Transient accept failure, continuing");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        .boxed()
    }

    fn max_accepts(&self) -> usize {
        default_max_accepts()
    }

    fn unbind(&self) {
        self.unbind_tx.send_replace(true);
    }

    fn local_target(&self) -> ListenTarget {
        self.target.clone()
    }
}

/// Listener over a unix domain socket.
#[cfg(unix)]
pub struct UnixConnectionListener {
    inner: tokio::net::UnixListener,
    path: std::path::PathBuf,
    unbind_tx: watch::Sender<bool>,
}

#[cfg(unix)]
impl ConnectionListener for UnixConnectionListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<AcceptedConnection>>> {
        let unbind = unbound(self.unbind_tx.subscribe());
        async move {
            tokio::pin!(unbind);
            loop {
                if *self.unbind_tx.borrow() {
                    return Ok(None);
                }
                tokio::select! {
                    _ = &mut unbind => return Ok(None),
                    result = self.inner.accept() => match result {
                        Ok((stream, peer)) => {
                            let remote = PeerAddress::Unix(peer.as_pathname().map(|p| p.to_path_buf()));
                            return Ok(Some(AcceptedConnection {
                                transport: Transport::Stream(Box::new(stream)),
                                local: PeerAddress::Unix(Some(self.path.clone())),
                                remote,
                            }));
                        }
                        Err(err) if is_transient(&err) => {
                            tracing::debug!(error = %err, "Transient accept failure, continuing");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        .boxed()
    }

    fn max_accepts(&self) -> usize {
        default_max_accepts()
    }

    fn unbind(&self) {
        if !self.unbind_tx.send_replace(true) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn local_target(&self) -> ListenTarget {
        ListenTarget::Unix(self.path.clone())
    }
}

/// Bind a concrete listen target.
///
/// `Localhost` must already have been expanded into its two loopback
/// addresses by the address resolver.
pub async fn bind_listener(target: &ListenTarget) -> io::Result<Arc<dyn ConnectionListener>> {
    match target {
        ListenTarget::Ip(addr) => {
            let listener = bind_tcp(*addr, false)?;
            let local = listener.local_addr()?;
            Ok(Arc::new(tcp_listener(listener, ListenTarget::Ip(local))))
        }
        ListenTarget::AnyIp(port) => {
            let listener = bind_any_ip(*port)?;
            let local = listener.local_addr()?;
            Ok(Arc::new(tcp_listener(listener, ListenTarget::AnyIp(local.port()))))
        }
        ListenTarget::Localhost(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "localhost must be resolved to loopback addresses before binding",
        )),
        #[cfg(unix)]
        ListenTarget::Unix(path) => {
            let inner = tokio::net::UnixListener::bind(path)?;
            let (unbind_tx, _) = watch::channel(false);
            Ok(Arc::new(UnixConnectionListener {
                inner,
                path: path.clone(),
                unbind_tx,
            }))
        }
        #[cfg(not(unix))]
        ListenTarget::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix domain sockets are not supported on this platform",
        )),
        ListenTarget::NamedPipe(name) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("named pipe transport is not supported: pipe:/{}", name),
        )),
    }
}

fn tcp_listener(inner: TcpListener, target: ListenTarget) -> TcpConnectionListener {
    let (unbind_tx, _) = watch::channel(false);
    TcpConnectionListener {
        inner,
        target,
        unbind_tx,
    }
}

fn bind_tcp(addr: SocketAddr, dual_mode: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(!dual_mode)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(std::net::TcpListener::from(socket))
}

/// Dual-mode IPv6 any address, falling back to IPv4 any when IPv6 is unavailable.
fn bind_any_ip(port: u16) -> io::Result<TcpListener> {
    match bind_tcp(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port), true) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Err(err),
        Err(err) => {
            tracing::debug!(port, error = %err, "IPv6 any address unavailable, binding IPv4 any address");
            bind_tcp(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), false)
        }
    }
}

/// Optional cap on concurrently open connections.
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionLimit {
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Wait for a free slot. Returns `None` only if the limit was closed.
    pub async fn acquire(&self) -> Option<ConnectionPermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| ConnectionPermit { _permit: permit })
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This holds even if the connection task panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
