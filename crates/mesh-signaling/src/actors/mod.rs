//! Actor model implementation for the mesh coordinator.
//!
//! ```text
//! MeshCoordinator (one per local peer)
//! ├── owns the session (room id, members, subscriptions)
//! └── owns N Connections (one per remote peer, at most capacity - 1)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single thread of control**: store listeners and transport sinks only
//!   enqueue `SessionEvent`s; all state changes happen on the coordinator task
//! - **Generation/epoch fencing**: events from an earlier session or an earlier
//!   connection to the same peer are dropped
//! - **CancellationToken**: cancelling the coordinator leaves the room first
//!
//! # Modules
//!
//! - [`coordinator`] - `MeshCoordinator` and its handle
//! - [`connection`] - `Connection` negotiation state machine
//! - [`messages`] - Commands, session events and mesh events

pub mod connection;
pub mod coordinator;
pub mod messages;

// Re-export primary types
pub use connection::{Connection, ConnectionEventSender, StateOutcome};
pub use coordinator::{MeshCoordinator, MeshCoordinatorHandle};
pub use messages::*;
