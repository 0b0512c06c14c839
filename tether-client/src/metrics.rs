//! Client metrics
//!
//! OpenTelemetry instruments recorded by `TetherClient` when observability
//! is enabled on the builder. Instruments come from the global meter
//! provider, so nothing is exported unless one is installed (for example
//! by `tether_core::init_observability`).
//!
//! # Metrics Collected
//!
//! - **tether.client.connection.state**: gauge (-1 failed, 0 disconnected, 1 connecting, 2 connected)
//! - **tether.client.requests.total** / **tether.client.request.duration**: by method and status
//! - **tether.client.errors.total**: by error kind
//! - **tether.client.reconnect.attempts** / **tether.client.reconnect.success**
//! - **tether.client.messages.received**: inbound messages by type
//! - **tether.client.decode.failures**: frames dropped by the frame extractor

use crate::connection_state::ConnectionState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    InstrumentationScope, KeyValue,
};
use tether_core::{Error, JsonRpcMessage};

/// Instruments for one client
pub struct ClientMetrics {
    pub connection_state: Gauge<i64>,
    pub requests_total: Counter<u64>,
    /// Seconds from send to reply
    pub request_duration: Histogram<f64>,
    pub errors_total: Counter<u64>,
    pub reconnect_attempts: Counter<u64>,
    pub reconnect_success: Counter<u64>,
    pub messages_received: Counter<u64>,
    pub decode_failures: Counter<u64>,
}

impl ClientMetrics {
    /// Instruments from the global meter named `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        let scope = InstrumentationScope::builder(service_name.into())
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        Self::new_with_meter(&global::meter_with_scope(scope))
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("tether.client.connection.state")
                .with_description("Connection state (-1=failed, 0=disconnected, 1=connecting, 2=connected)")
                .build(),
            requests_total: meter
                .u64_counter("tether.client.requests.total")
                .with_description("Requests sent")
                .build(),
            request_duration: meter
                .f64_histogram("tether.client.request.duration")
                .with_description("Request round trip in seconds")
                .with_unit("s")
                .build(),
            errors_total: meter
                .u64_counter("tether.client.errors.total")
                .with_description("Errors surfaced to listeners")
                .build(),
            reconnect_attempts: meter
                .u64_counter("tether.client.reconnect.attempts")
                .with_description("Scheduled automatic reconnects")
                .build(),
            reconnect_success: meter
                .u64_counter("tether.client.reconnect.success")
                .with_description("Automatic reconnects that succeeded")
                .build(),
            messages_received: meter
                .u64_counter("tether.client.messages.received")
                .with_description("Inbound JSON-RPC messages")
                .build(),
            decode_failures: meter
                .u64_counter("tether.client.decode.failures")
                .with_description("Inbound frames that did not decode")
                .build(),
        }
    }

    pub fn update_connection_state(&self, state: &ConnectionState) {
        self.connection_state.record(
            state.gauge_value(),
            &[KeyValue::new("state", state.as_str())],
        );
    }

    pub fn record_request(&self, method: &str, status: &'static str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", status),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    pub fn record_error(&self, error: &Error) {
        self.errors_total
            .add(1, &[KeyValue::new("error_type", error.kind())]);
        if matches!(error, Error::DecodingFailed(_)) {
            self.decode_failures.add(1, &[]);
        }
    }

    pub fn record_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempts
            .add(1, &[KeyValue::new("attempt", i64::from(attempt))]);
    }

    pub fn record_reconnect_success(&self) {
        self.reconnect_success.add(1, &[]);
    }

    pub fn record_message(&self, message: &JsonRpcMessage) {
        let kind = match message {
            JsonRpcMessage::Request(_) => "request",
            JsonRpcMessage::Notification(_) => "notification",
            JsonRpcMessage::Response(_) => "response",
            JsonRpcMessage::Error(_) => "error",
        };
        self.messages_received.add(1, &[KeyValue::new("type", kind)]);
    }
}
