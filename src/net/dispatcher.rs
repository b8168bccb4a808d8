//! Connection dispatcher: parallel accept loops over one listener.
//!
//! # Data Flow
//! ```text
//! listener.accept()
//!     → assign ConnectionId
//!     → registry.register()      (before the task exists)
//!     → tokio::spawn(handler.handle(connection))
//!     → on task exit: notify closed, unregister
//! ```
//!
//! # Design Decisions
//! - Registration happens before scheduling so management code can always
//!   enumerate and close a connection that exists
//! - "All loops finished" is tracked by counting exits, not entries, so a
//!   late-starting loop cannot race an early-finishing one
//! - An error escaping one accept loop is logged as critical and ends only
//!   that loop; the remaining loops keep serving

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::net::connection::{
    AcceptedConnection, ConnectionId, ConnectionLifetime, ConnectionRegistry, TransportConnection,
};
use crate::net::listener::{ConnectionLimit, ConnectionListener, ConnectionPermit};
use crate::observability::metrics;

/// Processes one accepted connection to completion.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, connection: TransportConnection) -> BoxFuture<'static, ()>;
}

/// Spawns and supervises accept loops.
#[derive(Clone)]
pub struct ConnectionDispatcher {
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    /// Configured accept concurrency; `None` uses the listener's maximum.
    max_accepts: Option<usize>,
    limit: Option<ConnectionLimit>,
}

impl ConnectionDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            registry,
            handler,
            max_accepts: None,
            limit: None,
        }
    }

    pub fn with_max_accepts(mut self, max_accepts: Option<usize>) -> Self {
        self.max_accepts = max_accepts;
        self
    }

    pub fn with_connection_limit(mut self, limit: Option<ConnectionLimit>) -> Self {
        self.limit = limit;
        self
    }

    /// Accept-loop count for a listener: `clamp(configured, 1, listener max)`.
    pub fn accept_concurrency(configured: Option<usize>, listener_max: usize) -> usize {
        let listener_max = listener_max.max(1);
        configured.unwrap_or(listener_max).clamp(1, listener_max)
    }

    /// Start accepting on `listener`. `endpoint` is the display url used in
    /// logs, metrics, and per-endpoint shutdown.
    pub fn start(&self, listener: Arc<dyn ConnectionListener>, endpoint: &str) -> AcceptLoops {
        let count = Self::accept_concurrency(self.max_accepts, listener.max_accepts());
        let endpoint: Arc<str> = Arc::from(endpoint);
        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);
        let (stop_tx, stop_rx) = watch::channel(false);
        let exited = Arc::new(AtomicUsize::new(0));

        tracing::debug!(endpoint = %endpoint, accept_loops = count, "Starting accept loops");

        let handles = (0..count)
            .map(|index| {
                let guard = LoopExitGuard {
                    exited: Arc::clone(&exited),
                    total: count,
                    done_tx: Arc::clone(&done_tx),
                };
                let this = self.clone();
                let listener = Arc::clone(&listener);
                let endpoint = Arc::clone(&endpoint);
                let stop = stop_rx.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    this.accept_loop(listener, endpoint, index, stop).await;
                })
            })
            .collect();

        AcceptLoops {
            endpoint,
            listener,
            handles,
            done_rx,
            stop_tx,
        }
    }

    async fn accept_loop(
        &self,
        listener: Arc<dyn ConnectionListener>,
        endpoint: Arc<str>,
        index: usize,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            // A loop parked on a saturated limit must still notice stop().
            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    permit = limit.acquire() => match permit {
                        Some(permit) => Some(permit),
                        None => break,
                    },
                    _ = stop.wait_for(|stopping| *stopping) => break,
                },
                None => None,
            };

            match listener.accept().await {
                Ok(Some(accepted)) => self.dispatch(accepted, &endpoint, permit),
                Ok(None) => {
                    tracing::debug!(endpoint = %endpoint, accept_loop = index, "Listener unbound, accept loop ending");
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        severity = "critical",
                        endpoint = %endpoint,
                        accept_loop = index,
                        error = %err,
                        "Unexpected error in accept loop, loop terminated"
                    );
                    break;
                }
            }
        }
    }

    fn dispatch(&self, accepted: AcceptedConnection, endpoint: &Arc<str>, permit: Option<ConnectionPermit>) {
        let id = ConnectionId::new();
        let lifetime = Arc::new(ConnectionLifetime::new(id, Arc::clone(endpoint)));

        self.registry.register(Arc::clone(&lifetime));
        metrics::record_connection_accepted(endpoint);

        tracing::debug!(
            connection_id = %id,
            endpoint = %endpoint,
            remote = %accepted.remote,
            "Connection registered"
        );

        let connection = TransportConnection {
            lifetime: Arc::clone(&lifetime),
            transport: accepted.transport,
            local: accepted.local,
            remote: accepted.remote,
        };

        let guard = ConnectionGuard {
            registry: Arc::clone(&self.registry),
            lifetime,
            _permit: permit,
        };
        let work = self.handler.handle(connection);
        tokio::spawn(async move {
            let _guard = guard;
            work.await;
        });
    }
}

/// Reports the connection closed and unregisters it when its task ends,
/// including by panic.
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    lifetime: Arc<ConnectionLifetime>,
    _permit: Option<ConnectionPermit>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.lifetime.notify_closed();
        self.registry.unregister(self.lifetime.id());
        metrics::record_connection_closed(self.lifetime.endpoint());
        tracing::debug!(connection_id = %self.lifetime.id(), "Connection closed");
    }
}

/// Counts loop exits and fires the shared finished signal on the last one.
struct LoopExitGuard {
    exited: Arc<AtomicUsize>,
    total: usize,
    done_tx: Arc<watch::Sender<bool>>,
}

impl Drop for LoopExitGuard {
    fn drop(&mut self) {
        if self.exited.fetch_add(1, Ordering::AcqRel) + 1 == self.total {
            self.done_tx.send_replace(true);
        }
    }
}

/// Handle to the accept loops of one listener.
pub struct AcceptLoops {
    endpoint: Arc<str>,
    listener: Arc<dyn ConnectionListener>,
    handles: Vec<JoinHandle<()>>,
    done_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl AcceptLoops {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn loop_count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Wait until every accept loop has exited.
    pub async fn finished(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Unbind the listener and wait for the loops to drain out.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.listener.unbind();
        self.finished().await;
    }
}

impl Drop for AcceptLoops {
    fn drop(&mut self) {
        self.listener.unbind();
        for handle in &self.handles {
            handle.abort();
        }
    }
}
