//! Metrics definitions for the relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (controller, room, connection)
//! - `message_type`: bounded by `ClientMessage` variants (~9 values)
//! - `operation`: bounded by registry operations (~6 values) and relay operations
//! - `reason`: bounded drop reasons (mailbox_full, connection_closed)
//! - `result`: success, failure, timeout

use axum::{routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Message handling latency - in-process fan-out, p99 < 50ms
        .set_buckets_for_metric(
            Matcher::Prefix("relay_message".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Registry latency - Redis round trips, p99 < 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("relay_registry".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set registry latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Router serving `GET /metrics` from a Prometheus handle.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

// ============================================================================
// Connection & Room Metrics (Gauges)
// ============================================================================

/// Set the number of open WebSocket connections.
///
/// Metric: `relay_connections_active`
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Set the number of live room actors.
///
/// Metric: `relay_rooms_active`
pub fn set_rooms_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_rooms_active").set(count as f64);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `relay_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic event.
///
/// Metric: `relay_actor_panics_total`
/// Labels: `actor_type`
///
/// Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("relay_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Message Metrics
// ============================================================================

/// Count one handled client message.
///
/// Metric: `relay_messages_total`
/// Labels: `message_type`
pub fn record_message(message_type: &str) {
    counter!("relay_messages_total", "message_type" => message_type.to_string()).increment(1);
}

/// Record client message handling latency.
///
/// Metric: `relay_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("relay_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record an outbound event dropped for a slow or closed connection.
///
/// Metric: `relay_messages_dropped_total`
/// Labels: `reason`
pub fn record_message_dropped(reason: &str) {
    counter!("relay_messages_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Registry Metrics
// ============================================================================

/// Record session registry operation latency.
///
/// Metric: `relay_registry_latency_seconds`
/// Labels: `operation` (add, remove, list, update, refresh, rooms_for_user)
pub fn record_registry_latency(operation: &str, duration: Duration) {
    histogram!("relay_registry_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Auth & Error Metrics
// ============================================================================

/// Record an authentication attempt.
///
/// Metric: `relay_auth_total`
/// Labels: `result` (success, failure, timeout)
pub fn record_auth(result: &str) {
    counter!("relay_auth_total", "result" => result.to_string()).increment(1);
}

/// Record error by category.
///
/// Metric: `relay_errors_total`
/// Labels: `operation`, `error_type`, `status_code`
///
/// `status_code` is the wire error code (2-7), not an HTTP status.
pub fn record_error(operation: &str, error_type: &str, status_code: u16) {
    counter!("relay_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string(),
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder these calls go to the no-op recorder;
    // they only exercise the label plumbing.

    #[test]
    fn test_gauges() {
        set_connections_active(0);
        set_connections_active(10_000);
        set_rooms_active(0);
        set_rooms_active(250);
    }

    #[test]
    fn test_actor_metrics() {
        for actor_type in ["controller", "room", "connection"] {
            set_actor_mailbox_depth(actor_type, 10);
            record_actor_panic(actor_type);
        }
    }

    #[test]
    fn test_message_metrics() {
        record_message("join");
        record_message_latency("signal", Duration::from_micros(300));
        record_message_dropped("mailbox_full");
        record_message_dropped("connection_closed");
    }

    #[test]
    fn test_registry_and_error_metrics() {
        record_registry_latency("add", Duration::from_micros(800));
        record_registry_latency("list", Duration::from_millis(2));
        record_auth("success");
        record_auth("timeout");
        record_error("join", "room_not_found", 4);
    }

    #[test]
    fn test_metric_names_and_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_connections_active(3);
            record_message("chat_send");
            record_message("chat_send");
            record_error("kick", "not_host", 3);
        });

        let snapshot = snapshotter.snapshot().into_vec();

        let connections = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "relay_connections_active")
            .expect("connections gauge recorded");
        assert_eq!(connections.3, DebugValue::Gauge(3.0.into()));

        let messages = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "relay_messages_total")
            .expect("messages counter recorded");
        assert_eq!(messages.3, DebugValue::Counter(2));
        assert!(messages
            .0
            .key()
            .labels()
            .any(|l| l.key() == "message_type" && l.value() == "chat_send"));

        let errors = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "relay_errors_total")
            .expect("errors counter recorded");
        assert!(errors
            .0
            .key()
            .labels()
            .any(|l| l.key() == "status_code" && l.value() == "3"));
    }

    #[tokio::test]
    async fn test_metrics_router_renders_prometheus_text() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use http_body_util::BodyExt;
        use tower::util::ServiceExt;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || set_rooms_active(7));

        let response = metrics_router(handle)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("relay_rooms_active 7"));
    }
}
