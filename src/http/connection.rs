//! Per-connection protocol selection and lifecycle state machine.
//!
//! # Responsibilities
//! - Pick HTTP/1.1, HTTP/2 or HTTP/3 for the connection
//! - Build exactly one request processor and run it
//! - Route heartbeat ticks, timeouts, shutdown, close and abort to it
//!
//! # State Machine
//! ```text
//! Initializing ──select──▶ Selected ──abort──▶ Aborted
//!      │                                        ▲
//!      └──────────abort / stop / closed─────────┘
//! ```
//!
//! # Design Decisions
//! - Every entry point reads the state and captures the processor under the
//!   lock, then acts on that snapshot after releasing it
//! - `abort` moves to `Aborted` while still holding the lock, so concurrent
//!   aborts converge on exactly one processor abort
//! - Transport completion is delivered to the processor at most once
//! - Lifetime subscriptions hold a `Weak` reference; the connection never
//!   keeps itself alive

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crate::http::processor::{
    ConnectionAbortedError, ProcessorContext, ProcessorError, ProcessorFactory, RequestProcessor,
};
use crate::http::protocols::{select_protocol, HttpProtocol, HttpProtocols, SelectionInput};
use crate::http::timeout::{HttpLimits, TimeoutControl, TimeoutReason};
use crate::net::connection::{ConnectionEndReason, ConnectionId, ConnectionLifetime, PeerAddress, Transport};
use crate::observability::metrics;

/// Facts protocol selection needs, gathered by the transport and TLS layers.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFeatures {
    pub tls: bool,
    pub alpn: Option<Vec<u8>>,
    /// Protocols enabled for this connection (endpoint or SNI entry).
    pub enabled: HttpProtocols,
    pub server_name: Option<String>,
}

enum ProtocolSelectionState {
    Initializing,
    Selected(Arc<dyn RequestProcessor>),
    Aborted(Option<Arc<dyn RequestProcessor>>),
}

struct ConnectionState {
    selection: ProtocolSelectionState,
    protocol: Option<HttpProtocol>,
    io_completed: bool,
}

/// Observable phase of a connection, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Initializing,
    Selected,
    Aborted,
}

/// One HTTP connection from protocol selection until close.
pub struct HttpConnection {
    lifetime: Arc<ConnectionLifetime>,
    factory: Arc<dyn ProcessorFactory>,
    timeout_control: Arc<TimeoutControl>,
    limits: HttpLimits,
    local: PeerAddress,
    remote: PeerAddress,
    state: Mutex<ConnectionState>,
}

impl HttpConnection {
    pub fn new(
        lifetime: Arc<ConnectionLifetime>,
        factory: Arc<dyn ProcessorFactory>,
        limits: HttpLimits,
        local: PeerAddress,
        remote: PeerAddress,
    ) -> Arc<Self> {
        Arc::new(Self {
            lifetime,
            factory,
            timeout_control: Arc::new(TimeoutControl::new()),
            limits,
            local,
            remote,
            state: Mutex::new(ConnectionState {
                selection: ProtocolSelectionState::Initializing,
                protocol: None,
                io_completed: false,
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.lifetime.id()
    }

    pub fn phase(&self) -> ConnectionPhase {
        match self.lock().selection {
            ProtocolSelectionState::Initializing => ConnectionPhase::Initializing,
            ProtocolSelectionState::Selected(_) => ConnectionPhase::Selected,
            ProtocolSelectionState::Aborted(_) => ConnectionPhase::Aborted,
        }
    }

    pub fn protocol(&self) -> Option<HttpProtocol> {
        self.lock().protocol
    }

    pub fn timeout_control(&self) -> &Arc<TimeoutControl> {
        &self.timeout_control
    }

    /// Select a protocol, build its processor, and run it to completion.
    ///
    /// Selection failures are logged and close the connection without a
    /// processor; they are not errors to the caller.
    pub async fn process(self: &Arc<Self>, transport: Transport, features: ConnectionFeatures) -> Result<(), ProcessorError> {
        let input = SelectionInput {
            tls: features.tls,
            alpn: features.alpn.as_deref(),
            multiplexed: transport.is_multiplexed(),
            enabled: features.enabled,
        };

        let protocol = match select_protocol(&input) {
            Ok(protocol) => protocol,
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.id(),
                    error = %err,
                    "Protocol selection failed, closing connection"
                );
                metrics::record_protocol_selection_failure();
                return Ok(());
            }
        };

        let context = ProcessorContext {
            connection_id: self.id(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            timeout_control: Arc::clone(&self.timeout_control),
            limits: self.limits.clone(),
            server_name: features.server_name,
        };
        let factory = Arc::clone(&self.factory);
        let Some(processor) = self.activate(protocol, || factory.create(protocol, context))? else {
            tracing::debug!(connection_id = %self.id(), "Connection stopped before protocol selection completed");
            return Ok(());
        };

        tracing::debug!(connection_id = %self.id(), protocol = %protocol, "Protocol selected");
        metrics::record_protocol_selected(protocol);

        processor.run(transport).await
    }

    /// Build the processor and move to `Selected` under the state lock, then
    /// wire the lifetime subscriptions. `build` is not called and `None` is
    /// returned if the connection already left `Initializing`.
    pub(crate) fn activate<F>(
        self: &Arc<Self>,
        protocol: HttpProtocol,
        build: F,
    ) -> Result<Option<Arc<dyn RequestProcessor>>, ProcessorError>
    where
        F: FnOnce() -> Result<Arc<dyn RequestProcessor>, ProcessorError>,
    {
        let processor = {
            let mut state = self.lock();
            match state.selection {
                ProtocolSelectionState::Initializing => {
                    let processor = build()?;
                    state.selection = ProtocolSelectionState::Selected(Arc::clone(&processor));
                    state.protocol = Some(protocol);
                    processor
                }
                ProtocolSelectionState::Selected(_) | ProtocolSelectionState::Aborted(_) => return Ok(None),
            }
        };

        let weak = Arc::downgrade(self);
        self.lifetime.on_heartbeat(move |now| {
            if let Some(connection) = weak.upgrade() {
                connection.tick(now);
            }
        });

        let weak = Arc::downgrade(self);
        self.lifetime.on_shutdown_requested(move || {
            if let Some(connection) = Weak::upgrade(&weak) {
                connection.stop_processing(ConnectionEndReason::GracefulAppShutdown);
            }
        });

        let weak = Arc::downgrade(self);
        self.lifetime.on_closed(move || {
            if let Some(connection) = Weak::upgrade(&weak) {
                connection.on_connection_closed();
            }
        });

        let weak = Arc::downgrade(self);
        self.lifetime.on_abort_requested(move |reason| {
            if let Some(connection) = Weak::upgrade(&weak) {
                connection.abort(ConnectionAbortedError::new("the connection was aborted by the server"), reason);
            }
        });

        // An idle connection that never sends a byte still gets a graceful stop.
        if matches!(protocol, HttpProtocol::Http1 | HttpProtocol::Http2) {
            self.timeout_control
                .reset_timeout(self.limits.keep_alive_timeout, TimeoutReason::KeepAlive);
        }
        Ok(Some(processor))
    }

    /// Heartbeat entry point.
    pub fn tick(&self, now: Instant) {
        let Some(processor) = self.selected_processor() else {
            return;
        };
        if let Some(reason) = self.timeout_control.tick(now) {
            self.on_timeout(reason);
        }
        processor.tick(now);
    }

    /// Route an expired timeout to the matching processor reaction.
    pub fn on_timeout(&self, reason: TimeoutReason) {
        let Some(processor) = self.selected_processor() else {
            return;
        };

        tracing::debug!(connection_id = %self.id(), reason = %reason, "Connection timeout");
        match reason {
            TimeoutReason::KeepAlive => {
                processor.stop_processing_next_request(ConnectionEndReason::KeepAliveTimeout);
            }
            TimeoutReason::RequestHeaders => processor.handle_request_headers_timeout(),
            TimeoutReason::ReadDataRate => processor.handle_read_data_rate_timeout(),
            TimeoutReason::WriteDataRate => self.abort(
                ConnectionAbortedError::new("the response data rate dropped below the configured minimum"),
                ConnectionEndReason::MinResponseDataRate,
            ),
            TimeoutReason::RequestBodyDrain | TimeoutReason::TimeoutFeature => self.abort(
                ConnectionAbortedError::new("the connection timed out"),
                ConnectionEndReason::ServerTimeout,
            ),
        }
    }

    /// Ask the connection to stop accepting requests.
    pub fn stop_processing(&self, reason: ConnectionEndReason) {
        let processor = {
            let mut state = self.lock();
            match &state.selection {
                ProtocolSelectionState::Initializing => {
                    state.selection = ProtocolSelectionState::Aborted(None);
                    None
                }
                ProtocolSelectionState::Selected(processor) => Some(Arc::clone(processor)),
                ProtocolSelectionState::Aborted(_) => None,
            }
        };
        if let Some(processor) = processor {
            processor.stop_processing_next_request(reason);
        }
    }

    /// The transport closed.
    pub fn on_connection_closed(&self) {
        let processor = {
            let mut state = self.lock();
            let processor = match &state.selection {
                ProtocolSelectionState::Initializing => {
                    state.selection = ProtocolSelectionState::Aborted(None);
                    None
                }
                ProtocolSelectionState::Selected(processor) => Some(Arc::clone(processor)),
                ProtocolSelectionState::Aborted(processor) => processor.clone(),
            };
            if processor.is_some() && !state.io_completed {
                state.io_completed = true;
                processor
            } else {
                None
            }
        };
        if let Some(processor) = processor {
            processor.on_input_or_output_completed();
        }
    }

    /// Abort the connection. Only the first call reaches the processor.
    pub fn abort(&self, error: ConnectionAbortedError, reason: ConnectionEndReason) {
        let processor = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.selection, ProtocolSelectionState::Aborted(None)) {
                ProtocolSelectionState::Initializing => None,
                ProtocolSelectionState::Selected(processor) => {
                    state.selection = ProtocolSelectionState::Aborted(Some(Arc::clone(&processor)));
                    Some(processor)
                }
                ProtocolSelectionState::Aborted(previous) => {
                    state.selection = ProtocolSelectionState::Aborted(previous);
                    return;
                }
            }
        };

        tracing::debug!(connection_id = %self.id(), reason = %reason, error = %error, "Connection aborted");
        metrics::record_connection_abort(reason);
        if let Some(processor) = processor {
            processor.abort(error, reason);
        }
    }

    fn selected_processor(&self) -> Option<Arc<dyn RequestProcessor>> {
        match &self.lock().selection {
            ProtocolSelectionState::Selected(processor) => Some(Arc::clone(processor)),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().expect("connection state mutex poisoned")
    }
}
