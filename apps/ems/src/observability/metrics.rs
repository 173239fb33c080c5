//! Prometheus metrics for the routing daemon.
//!
//! Transport-level counters (link failures, reconnects, exhausted channels,
//! unmatched RPC responses) are emitted by `duplex_transport` under the
//! `duplex_transport_` prefix and exported by the same recorder.
//!
//! # Example
//!
//! ```ignore
//! use ems::observability::{init_metrics, MetricsConfig};
//!
//! init_metrics(&MetricsConfig::with_port(9464))?;
//! record_status("open");
//! ```

use std::net::{Ipv4Addr, SocketAddr};

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Configuration for the metrics exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener.
    pub listen_addr: SocketAddr,
}

impl MetricsConfig {
    /// Listen on all interfaces at `port`.
    #[must_use]
    pub const fn with_port(port: u16) -> Self {
        Self {
            listen_addr: SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This starts an HTTP server that exposes metrics at `/metrics`.
///
/// # Errors
///
/// Returns an error if the exporter fails to start (e.g., port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(addr = %config.listen_addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// ============================================================================
// Dialog Metrics
// ============================================================================

/// Record a dialog opened by a client order.
pub fn record_dialog_opened(exec_mode: &str) {
    counter!("ems_dialogs_opened_total", "exec_mode" => exec_mode.to_string()).increment(1);
}

/// Record a status sent to clients.
pub fn record_status(resp: &str) {
    counter!("ems_statuses_total", "resp" => resp.to_string()).increment(1);
}

/// Set the number of open dialogs.
#[allow(clippy::cast_precision_loss)]
pub fn set_open_dialogs(count: usize) {
    gauge!("ems_open_dialogs").set(count as f64);
}

/// Record a client request refused by the routing engine.
pub fn record_rejected_request(kind: &str) {
    counter!("ems_rejected_requests_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Broker Metrics
// ============================================================================

/// Record a request handed to a broker adapter.
pub fn record_broker_request(broker: &str, method: &str) {
    counter!(
        "ems_broker_requests_total",
        "broker" => broker.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

/// Record a broker request answered with an error.
pub fn record_broker_request_failure(broker: &str) {
    counter!("ems_broker_request_failures_total", "broker" => broker.to_string()).increment(1);
}

/// Record an event received from a broker adapter.
pub fn record_brokerd_event(broker: &str, kind: &str) {
    counter!(
        "ems_brokerd_events_total",
        "broker" => broker.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a broker message dropped because no dialog matched it.
pub fn record_unknown_brokerd_message(broker: &str, reason: &str) {
    counter!(
        "ems_unknown_brokerd_messages_total",
        "broker" => broker.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record whether a broker session is usable.
pub fn set_broker_up(broker: &str, up: bool) {
    gauge!("ems_broker_up", "broker" => broker.to_string()).set(if up { 1.0 } else { 0.0 });
}

// ============================================================================
// Client Metrics
// ============================================================================

/// Set the number of connected clients.
#[allow(clippy::cast_precision_loss)]
pub fn set_connected_clients(count: usize) {
    gauge!("ems_connected_clients").set(count as f64);
}

/// Record a client frame that failed the schema.
pub fn record_malformed_client_frame() {
    counter!("ems_malformed_client_frames_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_port_binds_all_interfaces() {
        let config = MetricsConfig::with_port(9464);
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:9464");
    }

    #[test]
    fn recording_without_exporter_is_a_no_op() {
        record_dialog_opened("live");
        record_status("open");
        set_open_dialogs(3);
        record_broker_request("kraken", "order");
        set_broker_up("kraken", false);
        set_connected_clients(1);
    }
}
