//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! binder, dispatcher, handshake, protocol selection, certificate watcher
//!     → logging.rs (tracing subscriber: pretty or JSON on stdout)
//!     → metrics.rs (bind results, connection counts, aborts, certificate changes)
//!
//! Consumers:
//!     → stdout log shipping
//!     → Prometheus scrape of metrics_address
//! ```
//!
//! # Design Decisions
//! - Every connection-scoped event carries `connection_id`
//! - Metric recording is fire-and-forget; without an exporter it costs nothing

pub mod logging;
pub mod metrics;
