//! Switchyard: a multi-endpoint HTTP server front end.
//!
//! Binds configured addresses and endpoints, terminates TLS with per-hostname
//! (SNI) options, picks HTTP/1.1, HTTP/2 or HTTP/3 per connection, and hands
//! each connection to a request processor. Certificates on disk are watched
//! and endpoints are rebuilt when they really change.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod tls;

pub use config::ServerConfig;
pub use lifecycle::Shutdown;
pub use server::{Server, ServerBuilder, ServerError};
