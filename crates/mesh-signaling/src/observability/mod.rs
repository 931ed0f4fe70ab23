//! Observability for the mesh signaling core.
//!
//! Logging uses `tracing` with explicit `mesh.*` targets and safe,
//! allow-listed fields (room id, peer ids, pair key, reason). Metric labels
//! are bounded to prevent cardinality explosion:
//! - `outcome`: admission outcomes (joined, rejoined, room_full, room_not_found, error)
//! - `role`: initiator, responder
//! - `reason`: teardown reasons (6 values)
//! - `operation`: bounded by store operations this crate issues
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mesh_admissions_total` | Counter | `outcome` | Join attempts by result |
//! | `mesh_connections_started_total` | Counter | `role` | Connections opened |
//! | `mesh_connections_established_total` | Counter | `role` | Connections that reached connected |
//! | `mesh_teardowns_total` | Counter | `reason` | Connection teardowns |
//! | `mesh_connections_active` | Gauge | none | Live connections of this process |
//! | `mesh_candidates_rejected_total` | Counter | none | Remote candidates the transport refused |
//! | `mesh_cleanup_failures_total` | Counter | `operation` | Best-effort deletes that failed |
//! | `mesh_store_transaction_duration_seconds` | Histogram | `operation` | Store transaction latency |

pub mod metrics;

pub use metrics::{
    record_admission, record_candidate_rejected, record_cleanup_failure,
    record_connection_established, record_connection_started, record_teardown,
    record_transaction_duration, set_connections_active,
};
