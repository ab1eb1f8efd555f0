//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "ripple_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "ripple_sessions_active";
    pub const MESSAGES_TOTAL: &str = "ripple_messages_total";
    pub const STORE_MESSAGES: &str = "ripple_store_messages";
    pub const ERRORS_TOTAL: &str = "ripple_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of subscriber sessions since server start"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of active subscriber sessions"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages published");
    metrics::describe_gauge!(
        names::STORE_MESSAGES,
        "Current number of messages retained in the store"
    );
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

/// Record a new subscriber session.
pub fn record_session() {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record a subscriber session ending.
pub fn record_session_closed() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a published message.
pub fn record_message() {
    counter!(names::MESSAGES_TOTAL).increment(1);
}

/// Update the stored message count.
pub fn set_stored_messages(count: usize) {
    gauge!(names::STORE_MESSAGES).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records the session ending on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        record_session();
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        record_session_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard() {
        // Just test that it doesn't panic
        let _guard = SessionMetricsGuard::new();
    }
}
