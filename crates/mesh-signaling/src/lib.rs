//! Mesh Signaling Library
//!
//! Signaling and connection-lifecycle core for small full-mesh audio rooms.
//! A realtime key-value store is used purely as a relay:
//!
//! - Room admission with a hard capacity of 4 members, enforced transactionally
//! - Deterministic per-pair signaling channels (offer, answer, trickled candidates)
//! - A per-connection negotiation state machine
//! - A mesh coordinator that keeps connections in sync with room membership
//! - Store-side disconnect cleanup for members and empty rooms
//!
//! # Architecture
//!
//! ```text
//! MeshCoordinatorHandle ──mpsc──► MeshCoordinator (tokio task)
//!                                   │
//!            ┌──────────────────────┼─────────────────────┐
//!            ▼                      ▼                     ▼
//!     RoomAdmission           PairChannel         Connection × (n-1)
//!            │                      │                     │
//!            └──────► SignalingStore ◄────────────────────┤
//!                                                         ▼
//!                                               PeerTransport (host media)
//! ```
//!
//! Store listeners and transport sinks never touch state directly; they post
//! events to the coordinator's queue.
//!
//! # Modules
//!
//! - [`actors`] - Coordinator actor and connection state machine
//! - [`admission`] - Room creation, capped membership, disconnect cleanup
//! - [`pair_channel`] - Pair keys and signaling records
//! - [`store`] - Signaling store contract and persisted layout
//! - [`transport`] - Media transport contract
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types with boundary error codes
//! - [`observability`] - Metrics

pub mod actors;
pub mod admission;
pub mod config;
pub mod errors;
pub mod observability;
pub mod pair_channel;
pub mod store;
pub mod transport;

pub use actors::{JoinedRoom, MeshCoordinator, MeshCoordinatorHandle, MeshEvent, MeshState};
pub use config::MeshConfig;
pub use errors::MeshError;
pub use pair_channel::PairKey;
