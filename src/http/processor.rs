//! The request processor capability contract.
//!
//! A request processor is the per-protocol wire engine. This crate selects
//! the protocol, builds exactly one processor per connection, and forwards
//! lifecycle events to it; the engine itself is pluggable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;

use crate::http::protocols::HttpProtocol;
use crate::http::timeout::{HttpLimits, TimeoutControl};
use crate::net::connection::{ConnectionEndReason, ConnectionId, PeerAddress, Transport};

/// Errors raised while building or running a request processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("{0} is not supported by this request processor")]
    UnsupportedProtocol(HttpProtocol),

    #[error("a {0} processor cannot run on this transport")]
    TransportMismatch(HttpProtocol),

    #[error("connection I/O failed")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The error handed to a processor when its connection is aborted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection aborted: {message}")]
pub struct ConnectionAbortedError {
    message: String,
}

impl ConnectionAbortedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Per-protocol request engine bound to a single connection.
///
/// Every method except `run` may be called from any thread at any time,
/// concurrently with `run`.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Run the request loop until the transport closes or the processor stops.
    fn run(&self, transport: Transport) -> BoxFuture<'_, Result<(), ProcessorError>>;

    /// Finish the in-flight request (if any) and accept no more.
    fn stop_processing_next_request(&self, reason: ConnectionEndReason);

    fn handle_request_headers_timeout(&self);

    fn handle_read_data_rate_timeout(&self);

    fn tick(&self, now: Instant);

    /// Tear the connection down immediately.
    fn abort(&self, error: ConnectionAbortedError, reason: ConnectionEndReason);

    /// The transport finished in one direction; pending reads or writes will not complete.
    fn on_input_or_output_completed(&self);
}

/// What a processor knows about its connection when created.
#[derive(Clone)]
pub struct ProcessorContext {
    pub connection_id: ConnectionId,
    pub local: PeerAddress,
    pub remote: PeerAddress,
    pub timeout_control: Arc<TimeoutControl>,
    pub limits: HttpLimits,
    /// Server name the client sent during the TLS handshake, if any.
    pub server_name: Option<String>,
}

impl ProcessorContext {
    pub fn remote_socket(&self) -> Option<SocketAddr> {
        match self.remote {
            PeerAddress::Tcp(addr) => Some(addr),
            _ => None,
        }
    }
}

/// Builds request processors for a selected protocol.
pub trait ProcessorFactory: Send + Sync + 'static {
    fn create(
        &self,
        protocol: HttpProtocol,
        context: ProcessorContext,
    ) -> Result<Arc<dyn RequestProcessor>, ProcessorError>;
}
