//! Connection handler that turns accepted transports into HTTP connections.
//!
//! # Data Flow
//! ```text
//! TransportConnection
//!     → TLS handshake (TLS endpoints only, raced against abort)
//!     → ConnectionFeatures (tls?, ALPN, per-host protocols)
//!     → HttpConnection::process
//! ```

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::http::connection::{ConnectionFeatures, HttpConnection};
use crate::http::processor::ProcessorFactory;
use crate::http::protocols::HttpProtocols;
use crate::http::timeout::HttpLimits;
use crate::net::connection::{Transport, TransportConnection};
use crate::net::dispatcher::ConnectionHandler;
use crate::observability::metrics;
use crate::tls::TlsHandshake;

/// Per-endpoint HTTP connection setup.
#[derive(Clone)]
pub struct HttpConnectionHandler {
    factory: Arc<dyn ProcessorFactory>,
    limits: HttpLimits,
    protocols: HttpProtocols,
    tls: Option<Arc<TlsHandshake>>,
}

impl HttpConnectionHandler {
    pub fn new(
        factory: Arc<dyn ProcessorFactory>,
        limits: HttpLimits,
        protocols: HttpProtocols,
        tls: Option<Arc<TlsHandshake>>,
    ) -> Self {
        Self {
            factory,
            limits,
            protocols,
            tls,
        }
    }
}

impl ConnectionHandler for HttpConnectionHandler {
    fn handle(&self, connection: TransportConnection) -> BoxFuture<'static, ()> {
        let handler = self.clone();
        async move { handler.run(connection).await }.boxed()
    }
}

impl HttpConnectionHandler {
    async fn run(self, connection: TransportConnection) {
        let TransportConnection {
            lifetime,
            transport,
            local,
            remote,
        } = connection;
        let id = lifetime.id();

        let (transport, features) = match (transport, &self.tls) {
            (Transport::Stream(io), Some(tls)) => {
                let (abort_tx, abort_rx) = oneshot::channel();
                lifetime.on_abort_requested(move |reason| {
                    let _ = abort_tx.send(reason);
                });

                let outcome = tokio::select! {
                    result = tls.accept(io) => result,
                    Ok(reason) = abort_rx => {
                        tracing::debug!(connection_id = %id, reason = %reason, "Connection aborted during TLS handshake");
                        return;
                    }
                };

                match outcome {
                    Ok((stream, info)) => {
                        tracing::debug!(
                            connection_id = %id,
                            server_name = ?info.server_name,
                            alpn = ?info.alpn.as_deref().map(String::from_utf8_lossy),
                            "TLS handshake completed"
                        );
                        let features = ConnectionFeatures {
                            tls: true,
                            alpn: info.alpn,
                            enabled: info.protocols,
                            server_name: info.server_name,
                        };
                        (Transport::Stream(Box::new(stream)), features)
                    }
                    Err(err) => {
                        tracing::warn!(connection_id = %id, remote = %remote, error = %err, "TLS handshake failed");
                        metrics::record_tls_handshake_failure(err.kind());
                        return;
                    }
                }
            }
            (Transport::Stream(io), None) => (
                Transport::Stream(io),
                ConnectionFeatures {
                    tls: false,
                    alpn: None,
                    enabled: self.protocols,
                    server_name: None,
                },
            ),
            // Multiplexed transports carry their own TLS (QUIC).
            (Transport::Multiplexed(transport), _) => (
                Transport::Multiplexed(transport),
                ConnectionFeatures {
                    tls: true,
                    alpn: None,
                    enabled: self.protocols,
                    server_name: None,
                },
            ),
        };

        let connection = HttpConnection::new(lifetime, self.factory, self.limits, local, remote);
        if let Err(err) = connection.process(transport, features).await {
            tracing::debug!(connection_id = %id, error = %err, "Connection processing ended with an error");
        }
    }
}
