//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tandem_core::HubStats;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const MESSAGES_TOTAL: &str = "tandem_messages_total";
    pub const MESSAGES_BYTES: &str = "tandem_messages_bytes";
    pub const DOCUMENTS_ACTIVE: &str = "tandem_documents_active";
    pub const JOINS_TOTAL: &str = "tandem_joins_total";
    pub const CHANGES_TOTAL: &str = "tandem_changes_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "tandem_delivery_failures_total";
    pub const EVICTIONS_TOTAL: &str = "tandem_evictions_total";
    pub const LATENCY_SECONDS: &str = "tandem_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(
        names::DOCUMENTS_ACTIVE,
        "Documents with at least one joined connection"
    );
    metrics::describe_counter!(names::JOINS_TOTAL, "Total number of document joins");
    metrics::describe_counter!(names::CHANGES_TOTAL, "Total number of applied edits");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Events that could not be queued for a subscriber"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections dropped after a delivery failure"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
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

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound event latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

pub fn record_join() {
    counter!(names::JOINS_TOTAL).increment(1);
}

pub fn record_change() {
    counter!(names::CHANGES_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish the hub's current counters.
///
/// The hub keeps failure and eviction totals itself; the counters are set to
/// those totals.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::DOCUMENTS_ACTIVE).set(stats.active_documents as f64);
    counter!(names::DELIVERY_FAILURES_TOTAL).absolute(stats.delivery_failures);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evictions);
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
    fn test_metrics_without_recorder() {
        // No recorder installed: every call must be a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_message(42, "inbound");
        record_hub_stats(&HubStats {
            connection_count: 1,
            active_documents: 1,
            delivery_failures: 0,
            evictions: 0,
        });
    }

    #[test]
    fn test_hub_totals_are_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_hub_stats(&HubStats {
                connection_count: 2,
                active_documents: 1,
                delivery_failures: 3,
                evictions: 1,
            });
        });

        let rendered = handle.render();
        assert!(rendered.contains("# TYPE tandem_delivery_failures_total counter"));
        assert!(rendered.contains("tandem_delivery_failures_total 3"));
        assert!(rendered.contains("# TYPE tandem_evictions_total counter"));
        assert!(rendered.contains("tandem_evictions_total 1"));
        assert!(rendered.contains("# TYPE tandem_documents_active gauge"));
    }
}
