//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Address strings / configured endpoints
//!     → address.rs (parse, classify into listen targets)
//!     → binder.rs (strategy, localhost expansion, bind errors)
//!     → listener.rs (bind sockets, accept, connection limits)
//!     → dispatcher.rs (accept loops, registry, spawn per connection)
//!     → connection.rs (lifetime notifications, registry)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept concurrency and an optional connection semaphore
//! - Each connection tracked for graceful shutdown
//! - Listeners are trait objects so transports can be swapped in tests

pub mod address;
pub mod binder;
pub mod connection;
pub mod dispatcher;
pub mod endpoint;
pub mod listener;

pub use address::{parse_server_address, AddressError, BindingAddress, Scheme, ServerAddress};
pub use binder::{bind_all, AddressBindContext, BindError, BindStrategy, HttpsUpgrade, DEFAULT_SERVER_ADDRESS};
pub use connection::{
    AcceptedConnection, ConnectionEndReason, ConnectionId, ConnectionLifetime, ConnectionRegistry, PeerAddress,
    Transport, TransportConnection,
};
pub use dispatcher::{AcceptLoops, ConnectionDispatcher, ConnectionHandler};
pub use endpoint::{ListenOptions, ListenTarget};
pub use listener::{bind_listener, ConnectionLimit, ConnectionListener};
