//! Metrics collection and exposition.
//!
//! # Metrics
//! - `switchyard_endpoints_bound_total` (counter): endpoint binds by result
//! - `switchyard_connections_accepted_total` (counter): accepted transports by endpoint
//! - `switchyard_connections_closed_total` (counter): closed transports by endpoint
//! - `switchyard_active_connections` (gauge): live connections by endpoint
//! - `switchyard_protocol_selected_total` (counter): HTTP version chosen per connection
//! - `switchyard_protocol_selection_failures_total` (counter)
//! - `switchyard_connection_aborts_total` (counter): aborts by end reason
//! - `switchyard_tls_handshake_failures_total` (counter): failures by reason
//! - `switchyard_certificate_changes_total` (counter)
//! - `switchyard_heartbeat_duration_seconds` (histogram)
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - The active-connection gauge moves by one per accept and close, per endpoint

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::http::HttpProtocol;
use crate::net::connection::ConnectionEndReason;

const ENDPOINTS_BOUND: &str = "switchyard_endpoints_bound_total";
const CONNECTIONS_ACCEPTED: &str = "switchyard_connections_accepted_total";
const CONNECTIONS_CLOSED: &str = "switchyard_connections_closed_total";
const ACTIVE_CONNECTIONS: &str = "switchyard_active_connections";
const PROTOCOL_SELECTED: &str = "switchyard_protocol_selected_total";
const PROTOCOL_SELECTION_FAILURES: &str = "switchyard_protocol_selection_failures_total";
const CONNECTION_ABORTS: &str = "switchyard_connection_aborts_total";
const TLS_HANDSHAKE_FAILURES: &str = "switchyard_tls_handshake_failures_total";
const CERTIFICATE_CHANGES: &str = "switchyard_certificate_changes_total";
const HEARTBEAT_DURATION: &str = "switchyard_heartbeat_duration_seconds";

/// Install the Prometheus exporter, serving `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_bind(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(ENDPOINTS_BOUND, "result" => result).increment(1);
}

pub fn record_connection_accepted(endpoint: &str) {
    counter!(CONNECTIONS_ACCEPTED, "endpoint" => endpoint.to_string()).increment(1);
    gauge!(ACTIVE_CONNECTIONS, "endpoint" => endpoint.to_string()).increment(1.0);
}

pub fn record_connection_closed(endpoint: &str) {
    counter!(CONNECTIONS_CLOSED, "endpoint" => endpoint.to_string()).increment(1);
    gauge!(ACTIVE_CONNECTIONS, "endpoint" => endpoint.to_string()).decrement(1.0);
}

pub fn record_protocol_selected(protocol: HttpProtocol) {
    counter!(PROTOCOL_SELECTED, "protocol" => protocol.as_str()).increment(1);
}

pub fn record_protocol_selection_failure() {
    counter!(PROTOCOL_SELECTION_FAILURES).increment(1);
}

pub fn record_connection_abort(reason: ConnectionEndReason) {
    counter!(CONNECTION_ABORTS, "reason" => reason.as_str()).increment(1);
}

pub fn record_tls_handshake_failure(reason: &'static str) {
    counter!(TLS_HANDSHAKE_FAILURES, "reason" => reason).increment(1);
}

pub fn record_certificate_change() {
    counter!(CERTIFICATE_CHANGES).increment(1);
}

pub fn record_heartbeat(duration: Duration) {
    histogram!(HEARTBEAT_DURATION).record(duration.as_secs_f64());
}
