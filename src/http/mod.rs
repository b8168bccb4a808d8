//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TransportConnection (from the dispatcher)
//!     → handler.rs (TLS handshake for https endpoints)
//!     → connection.rs (protocol selection, lifecycle state machine)
//!     → processor.rs contract ← hyper_processor.rs (HTTP/1.1, HTTP/2)
//!       timing.rs reports reads and writes to the connection's timeouts
//!     → Application callback per request
//! ```

pub mod connection;
pub mod handler;
pub mod hyper_processor;
pub mod processor;
pub mod protocols;
pub mod timeout;
pub mod timing;

pub use connection::{ConnectionFeatures, ConnectionPhase, HttpConnection};
pub use handler::HttpConnectionHandler;
pub use hyper_processor::{Application, ConnectionInfoApplication, HyperProcessorFactory, RequestContext};
pub use processor::{ConnectionAbortedError, ProcessorContext, ProcessorError, ProcessorFactory, RequestProcessor};
pub use protocols::{select_protocol, HttpProtocol, HttpProtocols, ProtocolSelectionError, SelectionInput};
pub use timeout::{HttpLimits, MinDataRate, TimeoutControl, TimeoutReason};
pub use timing::{RequestBody, TimedIo};
