//! Metrics collection and export for rmessage.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use rmessage_core::{Distribution, RegistryStats, SweepReport};
use rmessage_protocol::TransportMessage;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "rmessage_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "rmessage_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "rmessage_connections_rejected_total";
    pub const CONNECTIONS_CLOSED: &str = "rmessage_connections_closed_total";
    pub const MESSAGES_TOTAL: &str = "rmessage_messages_total";
    pub const MESSAGES_BYTES: &str = "rmessage_messages_bytes";
    pub const DISTRIBUTIONS_TOTAL: &str = "rmessage_distributions_total";
    pub const SESSION_MESSAGES: &str = "rmessage_session_messages";
    pub const KEYS_ONLINE: &str = "rmessage_keys_online";
    pub const GROUPS_ACTIVE: &str = "rmessage_groups_active";
    pub const ACKS_PENDING: &str = "rmessage_acks_pending";
    pub const ACKS_RETRIED: &str = "rmessage_acks_retried_total";
    pub const ACKS_DROPPED: &str = "rmessage_acks_dropped_total";
    pub const ERRORS_TOTAL: &str = "rmessage_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused at the connection limit"
    );
    metrics::describe_counter!(names::CONNECTIONS_CLOSED, "Closed connections by reason");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total payload bytes of messages processed");
    metrics::describe_counter!(names::DISTRIBUTIONS_TOTAL, "Routing outcomes by kind");
    metrics::describe_histogram!(
        names::SESSION_MESSAGES,
        "Messages received per session lifetime"
    );
    metrics::describe_gauge!(names::KEYS_ONLINE, "Keys bound to a live session");
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of non-empty groups");
    metrics::describe_gauge!(names::ACKS_PENDING, "Deliveries awaiting acknowledgment");
    metrics::describe_counter!(names::ACKS_RETRIED, "Unacknowledged deliveries re-sent");
    metrics::describe_counter!(names::ACKS_DROPPED, "Unacknowledged deliveries given up");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record how a session ended and how much it carried.
pub fn record_session_closed(reason: &'static str, messages: u64) {
    counter!(names::CONNECTIONS_CLOSED, "reason" => reason).increment(1);
    histogram!(names::SESSION_MESSAGES).record(messages as f64);
}

/// Record an inbound message and its routing outcome.
pub fn record_distribution(message: &TransportMessage, outcome: &Distribution) {
    let category = message.category.as_str();
    counter!(names::MESSAGES_TOTAL, "category" => category).increment(1);
    counter!(names::MESSAGES_BYTES, "category" => category)
        .increment((message.body.len() + message.additional.len()) as u64);
    counter!(names::DISTRIBUTIONS_TOTAL, "outcome" => outcome.label()).increment(1);
}

/// Update presence and acknowledgment gauges.
pub fn set_routing_state(stats: &RegistryStats, pending_acks: usize) {
    gauge!(names::KEYS_ONLINE).set(stats.online_keys as f64);
    gauge!(names::GROUPS_ACTIVE).set(stats.group_count as f64);
    gauge!(names::ACKS_PENDING).set(pending_acks as f64);
}

/// Record an acknowledgment sweep.
pub fn record_sweep(report: &SweepReport) {
    counter!(names::ACKS_RETRIED).increment(report.retried as u64);
    counter!(names::ACKS_DROPPED).increment(report.dropped as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_distribution(
            &TransportMessage::one("a", "b", "hi"),
            &Distribution::AckUnmatched,
        );
        record_sweep(&SweepReport::default());
        record_session_closed("peer_closed", 3);
    }
}
