//! Metrics definitions for the SFU signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `event`: 5 signaling events plus `invalid`
//! - `outcome`: `success` or one of the `SignalingError` type labels
//! - `kind`: transport, producer, consumer
//! - `actor_type`: registry, connection

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Signaling latency is
/// dominated by engine calls, so the buckets extend to several seconds.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Metric: `sfu_sessions_active`
///
/// Updated by the registry after every session is created or destroyed.
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_sessions_active").set(count as f64);
}

/// Metric: `sfu_producers_active`
///
/// Revoked producers (tombstones) are not counted.
pub fn set_producers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_producers_active").set(count as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record a handled signaling request.
///
/// Metric: `sfu_signaling_requests_total`
/// Labels: `event`, `outcome`
pub fn record_signaling_request(event: &str, outcome: &str) {
    counter!("sfu_signaling_requests_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record signaling request latency, engine calls included.
///
/// Metric: `sfu_signaling_latency_seconds`
/// Labels: `event`
pub fn record_signaling_latency(event: &str, duration: Duration) {
    histogram!("sfu_signaling_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Engine resources
// ============================================================================

/// Record an engine resource closed during session teardown.
///
/// Metric: `sfu_engine_closes_total`
/// Labels: `kind`
pub fn record_engine_close(kind: &str) {
    counter!("sfu_engine_closes_total", "kind" => kind.to_string()).increment(1);
}

/// Record a resource that an engine call produced after its connection went
/// away (or after the call timed out), closed without being registered.
///
/// Metric: `sfu_late_resources_closed_total`
/// Labels: `kind`
pub fn record_late_resource_closed(kind: &str) {
    counter!("sfu_late_resources_closed_total", "kind" => kind.to_string()).increment(1);
}

/// Record a `producerClosed` notification dropped because the consumer's
/// connection was not draining its notifications.
///
/// Metric: `sfu_notifications_dropped_total`
pub fn record_notification_dropped() {
    counter!("sfu_notifications_dropped_total").increment(1);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::DebuggingRecorder;
    use std::collections::HashSet;

    // Without an installed recorder the macros record to a no-op recorder,
    // which is enough to exercise the helpers.

    #[test]
    fn test_gauges_accept_any_count() {
        set_connections_active(0);
        set_connections_active(10_000);
        set_sessions_active(3);
        set_producers_active(7);
    }

    #[test]
    fn test_bounded_labels() {
        let events = [
            "getRouterRtpCapabilities",
            "createTransport",
            "connectTransport",
            "createProducer",
            "createConsumer",
            "invalid",
        ];
        for event in &events {
            record_signaling_request(event, "success");
            record_signaling_latency(event, Duration::from_millis(3));
        }
        for kind in &["transport", "producer", "consumer"] {
            record_engine_close(kind);
            record_late_resource_closed(kind);
        }
        for actor_type in &["registry", "connection"] {
            record_actor_panic(actor_type);
        }
        record_notification_dropped();
    }

    #[test]
    fn test_metric_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_connections_active(2);
            set_sessions_active(2);
            set_producers_active(1);
            record_signaling_request("createProducer", "success");
            record_signaling_latency("createProducer", Duration::from_millis(12));
            record_engine_close("transport");
            record_late_resource_closed("consumer");
            record_actor_panic("connection");
            record_notification_dropped();
        });

        let names: HashSet<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "sfu_connections_active",
            "sfu_sessions_active",
            "sfu_producers_active",
            "sfu_signaling_requests_total",
            "sfu_signaling_latency_seconds",
            "sfu_engine_closes_total",
            "sfu_late_resources_closed_total",
            "sfu_actor_panics_total",
            "sfu_notifications_dropped_total",
        ] {
            assert!(names.contains(expected), "missing metric {expected}");
        }
    }
}
