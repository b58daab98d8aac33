//! Client metrics definitions
//!
//! OpenTelemetry instruments describing client health. They are recorded
//! only when a `ClientMetrics` is handed to the builder, and exported by
//! whatever meter provider `tiip_core::init_observability` installed.
//!
//! # Metrics Collected
//!
//! - **tiip.client.connection.state**: ready state code (gauge)
//! - **tiip.client.requests.total**: correlated requests by type and status (counter)
//! - **tiip.client.request.duration**: request latency in seconds (histogram)
//! - **tiip.client.errors.total**: errors by kind (counter)
//! - **tiip.client.reconnection.attempts**: scheduled reconnects (counter)
//! - **tiip.client.reconnection.success**: reconnects that reached OPEN (counter)
//! - **tiip.client.publications.received**: routed publications by outcome (counter)
//! - **tiip.client.relogin.total**: automatic relogins by outcome (counter)
//!
//! # Examples
//!
//! ```rust,no_run
//! use tiip_client::{ClientBuilder, ClientMetrics};
//! use std::sync::Arc;
//!
//! # fn example() -> tiip_core::Result<()> {
//! let metrics = Arc::new(ClientMetrics::new("my-app"));
//! let socket = ClientBuilder::new("ws://localhost:8080")
//!     .with_metrics(metrics)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Client metrics for monitoring
pub struct ClientMetrics {
    /// Ready state (0=closed, 1=connecting, 2=open, 3=closing, 4=reconnect aborted)
    pub connection_state: Gauge<i64>,
    /// Total number of correlated requests
    pub requests_total: Counter<u64>,
    /// Request duration in seconds
    pub request_duration: Histogram<f64>,
    /// Total number of errors
    pub errors_total: Counter<u64>,
    /// Total number of reconnection attempts
    pub reconnection_attempts: Counter<u64>,
    /// Total number of successful reconnections
    pub reconnection_success: Counter<u64>,
    /// Total number of publications received
    pub publications_received: Counter<u64>,
    /// Total number of automatic relogins
    pub relogins_total: Counter<u64>,
}

impl ClientMetrics {
    /// Create metrics on the global meter provider
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    /// Create metrics on a specific meter
    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("tiip.client.connection.state")
                .with_description(
                    "Ready state (0=closed, 1=connecting, 2=open, 3=closing, 4=reconnect aborted)",
                )
                .build(),
            requests_total: meter
                .u64_counter("tiip.client.requests.total")
                .with_description("Total number of correlated requests")
                .build(),
            request_duration: meter
                .f64_histogram("tiip.client.request.duration")
                .with_description("Request duration in seconds")
                .build(),
            errors_total: meter
                .u64_counter("tiip.client.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
            reconnection_attempts: meter
                .u64_counter("tiip.client.reconnection.attempts")
                .with_description("Total number of reconnection attempts")
                .build(),
            reconnection_success: meter
                .u64_counter("tiip.client.reconnection.success")
                .with_description("Total number of successful reconnections")
                .build(),
            publications_received: meter
                .u64_counter("tiip.client.publications.received")
                .with_description("Total number of publications received")
                .build(),
            relogins_total: meter
                .u64_counter("tiip.client.relogin.total")
                .with_description("Total number of automatic relogins")
                .build(),
        }
    }

    pub fn update_connection_state(&self, state: i64) {
        self.connection_state.record(state, &[]);
    }

    /// Record a finished correlated request
    pub fn record_request(&self, kind: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("type", kind.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    pub fn record_error(&self, error_kind: &str) {
        let attributes = &[KeyValue::new("error_type", error_kind.to_string())];
        self.errors_total.add(1, attributes);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.add(1, &[]);
    }

    pub fn record_reconnection_success(&self) {
        self.reconnection_success.add(1, &[]);
    }

    /// Record a publication; `routed` is false when no subscription matched
    pub fn record_publication(&self, routed: bool) {
        let attributes = &[KeyValue::new("routed", routed)];
        self.publications_received.add(1, attributes);
    }

    pub fn record_relogin(&self, success: bool) {
        let status = if success { "success" } else { "failure" };
        let attributes = &[KeyValue::new("status", status)];
        self.relogins_total.add(1, attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ClientMetrics::new("test-client");

        // No exporter is installed; recording must still be safe
        metrics.update_connection_state(2);
        metrics.record_request("req", "ok", 0.05);
        metrics.record_error("timeout");
        metrics.record_reconnection_attempt();
        metrics.record_reconnection_success();
        metrics.record_publication(true);
        metrics.record_relogin(false);
    }

    #[test]
    fn test_request_outcomes() {
        let metrics = ClientMetrics::new("test-client-req");

        metrics.record_request("init", "ok", 0.01);
        metrics.record_request("sub", "rejected", 0.02);
        metrics.record_request("req", "timeout", 30.0);
        metrics.record_publication(false);
    }
}
