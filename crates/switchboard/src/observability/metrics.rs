//! Metrics definitions for Switchboard.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sb_` prefix for Switchboard
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `kind`: join kinds (3 values) plus signal kinds (4 values)
//! - `reason`: bounded close/drop reasons (~6 values)
//! - `operation`: bounded by durable store methods (6 values)
//! - `actor_type`: 2 values (registry, room)
//!
//! Room and participant identifiers are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle for
/// rendering the `/metrics` endpoint.
///
/// Must be called before any metrics are recorded. Configures histogram
/// buckets aligned with the store latency target (p99 < 10ms for Redis
/// round-trips, with a long tail for degraded networks).
///
/// # Errors
///
/// Returns an error if the recorder fails to install (e.g., already
/// installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Durable store latency buckets - internal service call (like DB queries)
        .set_buckets_for_metric(
            Matcher::Prefix("sb_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Population Metrics (Gauges)
// ============================================================================

/// Set the number of rooms currently resident in the registry.
///
/// Metric: `sb_rooms_active`
/// Labels: none
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sb_rooms_active").set(count as f64);
}

/// Count a batch of participant records entering live rooms at once,
/// as happens when a room is rehydrated from its durable record.
///
/// Metric: `sb_participants_active`
/// Labels: none
///
/// The gauge counts both active and grace-period (inactive) participants;
/// a record leaves it only when it is removed from its room.
pub fn add_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sb_participants_active").increment(count as f64);
}

/// Adjust the live participant gauge by one.
///
/// Room actors call these on insert/remove; no single component knows the
/// global count, so the gauge is maintained incrementally.
pub fn increment_participants_active() {
    gauge!("sb_participants_active").increment(1.0);
}

/// See [`increment_participants_active`].
pub fn decrement_participants_active() {
    gauge!("sb_participants_active").decrement(1.0);
}

/// Set the number of sessions held in the live session cache.
///
/// Metric: `sb_sessions_active`
/// Labels: none
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sb_sessions_active").set(count as f64);
}

// ============================================================================
// Room Lifecycle Metrics (Counters)
// ============================================================================

/// Record a room creation.
///
/// Metric: `sb_rooms_created_total`
/// Labels: none
pub fn increment_rooms_created() {
    counter!("sb_rooms_created_total").increment(1);
}

/// Record a room teardown.
///
/// Metric: `sb_rooms_closed_total`
/// Labels: `reason` (emptied, idle)
///
/// Cardinality: 2 (bounded by teardown paths)
pub fn increment_rooms_closed(reason: &str) {
    counter!("sb_rooms_closed_total", "reason" => reason.to_string()).increment(1);
}

/// Record a join operation.
///
/// Metric: `sb_joins_total`
/// Labels: `kind` (created, joined, rejoined)
///
/// Cardinality: 3 (bounded by join paths)
pub fn increment_joins(kind: &str) {
    counter!("sb_joins_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Signaling Metrics (Counters)
// ============================================================================

/// Record a signaling message forwarded to its target.
///
/// Metric: `sb_signals_relayed_total`
/// Labels: `kind` (offer, answer, ice_candidate, initiate_offer)
///
/// Cardinality: 4 (bounded by signal kinds)
pub fn increment_signals_relayed(kind: &str) {
    counter!("sb_signals_relayed_total", "kind" => kind.to_string()).increment(1);
}

/// Record a signaling message that could not be delivered.
///
/// Metric: `sb_signals_dropped_total`
/// Labels: `reason` (unknown_sender, unknown_target, inactive_target,
/// backpressure, no_sender)
///
/// Cardinality: 5 (bounded by drop reasons)
///
/// Drops are expected during churn (target left between send and delivery);
/// a sustained backpressure rate indicates a stuck client connection.
pub fn increment_signals_dropped(reason: &str) {
    counter!("sb_signals_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Expiry Metrics (Counters)
// ============================================================================

/// Record a participant removed because its disconnect grace window expired.
///
/// Metric: `sb_grace_removals_total`
/// Labels: none
pub fn increment_grace_removals() {
    counter!("sb_grace_removals_total").increment(1);
}

/// Record sessions evicted by the expiry sweeper.
///
/// Metric: `sb_sessions_pruned_total`
/// Labels: none
pub fn increment_sessions_pruned(count: u64) {
    counter!("sb_sessions_pruned_total").increment(count);
}

// ============================================================================
// Durable Store Metrics
// ============================================================================

/// Record durable store operation latency.
///
/// Metric: `sb_store_latency_seconds`
/// Labels: `operation`
///
/// Cardinality: 6 (save_room, load_room, delete_room, save_session,
/// load_session, delete_session)
///
/// SLO target: p99 < 10ms against a local Redis
pub fn observe_store_latency(operation: &str, duration: Duration) {
    histogram!("sb_store_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a best-effort durable store write that failed.
///
/// Metric: `sb_store_failures_total`
/// Labels: `operation`
///
/// Failures are swallowed at the call site (the live cache stays
/// authoritative); this counter is the only signal that writes are failing.
pub fn increment_store_failures(operation: &str) {
    counter!("sb_store_failures_total", "operation" => operation.to_string()).increment(1);
}

// ============================================================================
// Actor Health Metrics (Counters)
// ============================================================================

/// Record an actor task that exited abnormally.
///
/// Metric: `sb_actor_panics_total`
/// Labels: `actor_type` (registry, room)
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn increment_actor_panics(actor_type: &str) {
    counter!("sb_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
