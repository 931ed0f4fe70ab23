//! Metrics definitions for the mesh signaling core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! Recording is a no-op until the embedding application installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Admission
// ============================================================================

/// Record a join attempt.
///
/// Metric: `mesh_admissions_total`
/// Labels: `outcome` (joined, rejoined, room_full, room_not_found, error)
pub fn record_admission(outcome: &str) {
    counter!("mesh_admissions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record store transaction latency.
///
/// Metric: `mesh_store_transaction_duration_seconds`
/// Labels: `operation` (create_room, join_room, remove_room)
pub fn record_transaction_duration(operation: &str, duration: Duration) {
    histogram!("mesh_store_transaction_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Record a connection being opened.
///
/// Metric: `mesh_connections_started_total`
/// Labels: `role` (initiator, responder)
pub fn record_connection_started(role: &str) {
    counter!("mesh_connections_started_total", "role" => role.to_string()).increment(1);
}

/// Record a connection reaching connected/completed.
///
/// Metric: `mesh_connections_established_total`
/// Labels: `role` (initiator, responder)
pub fn record_connection_established(role: &str) {
    counter!("mesh_connections_established_total", "role" => role.to_string()).increment(1);
}

/// Record a connection teardown.
///
/// Metric: `mesh_teardowns_total`
/// Labels: `reason` (peer_left, transport_failed, negotiation_failed, superseded, local_leave, shutdown)
pub fn record_teardown(reason: &str) {
    counter!("mesh_teardowns_total", "reason" => reason.to_string()).increment(1);
}

/// Set the number of live connections owned by a coordinator.
///
/// Metric: `mesh_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for mesh sizes
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_connections_active").set(count as f64);
}

// ============================================================================
// Signaling hygiene
// ============================================================================

/// Record a remote candidate rejected by the transport.
///
/// Metric: `mesh_candidates_rejected_total`
pub fn record_candidate_rejected() {
    counter!("mesh_candidates_rejected_total").increment(1);
}

/// Record a failed best-effort cleanup.
///
/// Metric: `mesh_cleanup_failures_total`
/// Labels: `operation` (clear_offer, clear_answer, clear_candidates, clear_peer_records,
/// remove_member, cancel_deferred, close_transport)
pub fn record_cleanup_failure(operation: &str) {
    counter!("mesh_cleanup_failures_total", "operation" => operation.to_string()).increment(1);
}
