//! Prometheus metrics for the SFU service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling requests include engine round trips (p99 < 250ms)
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Metric: `sfu_workers_alive`
///
/// Drops below the configured worker count while a worker is respawning.
pub fn set_workers_alive(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_alive").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type` (registry, pool, room, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    // usize to f64 conversion is safe for realistic mailbox depths
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record request handling latency.
///
/// Metric: `sfu_signaling_latency_seconds`
/// Labels: `method`
///
/// Unknown methods are recorded as `unknown` so the label stays bounded.
pub fn record_signaling_latency(method: &str, duration: Duration) {
    histogram!("sfu_signaling_latency_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_signaling_errors_total`
/// Labels: `method`, `code`
pub fn record_signaling_error(method: &str, code: i32) {
    counter!(
        "sfu_signaling_errors_total",
        "method" => method.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a notification dropped because the client's queue was full.
///
/// Metric: `sfu_notifications_dropped_total`
/// Labels: `event`
pub fn record_notification_dropped(event: &'static str) {
    counter!("sfu_notifications_dropped_total", "event" => event).increment(1);
}

// ============================================================================
// Media entities
// ============================================================================

/// Metric: `sfu_entities_created_total`
/// Labels: `kind` (transport, producer, consumer)
pub fn record_entity_created(kind: &'static str) {
    counter!("sfu_entities_created_total", "kind" => kind).increment(1);
}

/// Record a transport, producer or consumer being torn down.
///
/// Metric: `sfu_entities_closed_total`
/// Labels: `kind`, `reason`
///
/// Reasons are static strings naming the cascade that closed the entity
/// (e.g. `client`, `peer_left`, `producer_closed`, `worker_died`).
pub fn record_entity_closed(kind: &'static str, reason: &'static str) {
    counter!("sfu_entities_closed_total", "kind" => kind, "reason" => reason).increment(1);
}

/// Metric: `sfu_consume_rejected_total`
pub fn record_consume_rejected() {
    counter!("sfu_consume_rejected_total").increment(1);
}

// ============================================================================
// Workers
// ============================================================================

/// Record a media worker dying.
///
/// Metric: `sfu_worker_deaths_total`
///
/// ALERT: any non-zero rate warrants a look at the worker logs.
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

/// Metric: `sfu_worker_respawns_total`
pub fn record_worker_respawn() {
    counter!("sfu_worker_respawns_total").increment(1);
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
mod tests {
    use super::*;

    // These run against the global no-op recorder; they exercise the label
    // plumbing without asserting on values.

    #[test]
    fn test_gauges() {
        set_rooms_active(0);
        set_rooms_active(12);
        set_connections_active(40);
        set_workers_alive(4);
        set_actor_mailbox_depth("registry", 0);
        set_actor_mailbox_depth("room", 120);
        set_actor_mailbox_depth("connection", 256);
    }

    #[test]
    fn test_signaling_metrics() {
        record_signaling_latency("produce", Duration::from_millis(3));
        record_signaling_latency("unknown", Duration::from_micros(40));
        record_signaling_error("consume", 1);
        record_signaling_error("createWebRtcTransport", 7);
        record_notification_dropped("new-producer");
    }

    #[test]
    fn test_entity_metrics() {
        record_entity_created("transport");
        record_entity_created("producer");
        record_entity_closed("consumer", "producer_closed");
        record_entity_closed("transport", "worker_died");
        record_consume_rejected();
    }

    #[test]
    fn test_worker_metrics() {
        record_worker_death();
        record_worker_respawn();
        record_actor_panic("room");
    }
}
