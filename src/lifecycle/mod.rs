//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Heartbeat (heartbeat.rs):
//!     every interval → ConnectionRegistry::tick_all → per-connection timeouts
//!
//! Shutdown (shutdown.rs):
//!     trigger → background tasks (heartbeat, reload loop) exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful server stop
//!     SIGHUP → config reload
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, abort stragglers, close
//! - Shutdown has timeout: remaining connections are aborted after the deadline

pub mod heartbeat;
pub mod shutdown;
pub mod signals;

pub use heartbeat::Heartbeat;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{SignalEvent, Signals};
