//! Prometheus Metrics Module
//!
//! Exposes hub metrics in Prometheus format, served at `/metrics` on the
//! health server port.
//!
//! # Metrics Categories
//!
//! - **Upstream**: frames received, decode drops, frames sent by kind,
//!   reconnects, terminal failures, connection phase
//! - **Subscriptions**: active upstream keys, handler panics
//! - **Fan-out**: connected endpoints, delivered and dropped events,
//!   emitted snapshots

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::upstream::ConnectionPhase;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns the exporter's [`BuildError`] if the recorder cannot be
/// installed, for example because another global recorder exists.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream counters
    describe_counter!(
        "market_feed_frames_received_total",
        "Text frames received from upstream sources"
    );
    describe_counter!(
        "market_feed_decode_dropped_total",
        "Inbound frames that did not decode to any price or bar"
    );
    describe_counter!(
        "market_feed_upstream_frames_total",
        "Frames sent upstream by kind"
    );
    describe_counter!(
        "market_feed_outbound_dropped_total",
        "Outbound frames dropped because the connection was not open"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Scheduled reconnect attempts"
    );
    describe_counter!(
        "market_feed_unavailable_total",
        "Times a source exhausted its retry budget"
    );
    describe_gauge!(
        "market_feed_connection_phase",
        "Connection phase (0 disconnected, 1 connecting, 2 open, 3 closing)"
    );

    // Subscriptions
    describe_gauge!(
        "market_feed_active_keys",
        "Keys with an upstream subscription"
    );
    describe_counter!(
        "market_feed_handler_panics_total",
        "Subscription handlers that panicked during dispatch"
    );

    // Fan-out
    describe_gauge!("market_feed_endpoints", "Registered fan-out endpoints");
    describe_counter!(
        "market_feed_events_delivered_total",
        "Hub events delivered to endpoints"
    );
    describe_counter!(
        "market_feed_events_dropped_total",
        "Hub events dropped because an endpoint was full"
    );
    describe_counter!(
        "market_feed_snapshots_emitted_total",
        "Snapshots broadcast by the emitter"
    );
}

// =============================================================================
// Upstream
// =============================================================================

/// Record a text frame received from a source.
pub fn record_frame_received(namespace: &str) {
    counter!("market_feed_frames_received_total", "namespace" => namespace.to_string())
        .increment(1);
}

/// Record a frame that decoded to nothing.
pub fn record_decode_dropped(namespace: &str) {
    counter!("market_feed_decode_dropped_total", "namespace" => namespace.to_string())
        .increment(1);
}

/// Record a frame written upstream.
pub fn record_upstream_frame(namespace: &str, kind: &'static str) {
    counter!(
        "market_feed_upstream_frames_total",
        "namespace" => namespace.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record an outbound frame dropped while the connection was not open.
pub fn record_frame_dropped(namespace: &str) {
    counter!("market_feed_outbound_dropped_total", "namespace" => namespace.to_string())
        .increment(1);
}

/// Record a scheduled reconnect.
pub fn record_reconnect(namespace: &str) {
    counter!("market_feed_reconnects_total", "namespace" => namespace.to_string()).increment(1);
}

/// Record a source giving up after its retry budget.
pub fn record_feed_unavailable(namespace: &str) {
    counter!("market_feed_unavailable_total", "namespace" => namespace.to_string()).increment(1);
}

/// Update the connection phase gauge.
pub fn set_connection_phase(namespace: &str, phase: ConnectionPhase) {
    gauge!("market_feed_connection_phase", "namespace" => namespace.to_string())
        .set(phase.as_gauge());
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Update the number of keys subscribed upstream.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_keys(count: usize) {
    gauge!("market_feed_active_keys").set(count as f64);
}

/// Record handler panics caught during dispatch.
pub fn record_handler_panics(count: u64) {
    counter!("market_feed_handler_panics_total").increment(count);
}

// =============================================================================
// Fan-out
// =============================================================================

/// Update the number of registered endpoints.
#[allow(clippy::cast_precision_loss)]
pub fn set_endpoints(count: usize) {
    gauge!("market_feed_endpoints").set(count as f64);
}

/// Record the outcome of one broadcast.
pub fn record_broadcast(kind: &'static str, delivered: u64, dropped: u64) {
    counter!("market_feed_events_delivered_total", "event" => kind).increment(delivered);
    if dropped > 0 {
        counter!("market_feed_events_dropped_total", "event" => kind).increment(dropped);
    }
}

/// Record a snapshot broadcast by the emitter.
pub fn record_snapshot_emitted(namespace: &str) {
    counter!("market_feed_snapshots_emitted_total", "namespace" => namespace.to_string())
        .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
