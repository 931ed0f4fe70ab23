//! Message types for the mesh coordinator.
//!
//! Commands reach the coordinator through a bounded `tokio::sync::mpsc`
//! mailbox with `oneshot` replies. Store listeners and transport sinks post
//! [`SessionEvent`]s onto a separate unbounded queue; every event carries the
//! session generation it was registered under so events from an earlier
//! session are discarded.

use crate::errors::MeshError;
use crate::pair_channel::{CandidateRecord, CandidateRole, DescriptionRecord};
use crate::transport::TransportEvent;
use std::fmt;
use tokio::sync::oneshot;

/// Commands sent to `MeshCoordinator`.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Join (and optionally create) a room.
    Join {
        /// `None` generates a fresh room id (requires `create_if_missing`).
        room_id: Option<String>,
        create_if_missing: bool,
        respond_to: oneshot::Sender<Result<JoinedRoom, MeshError>>,
    },

    /// Leave the current room. No-op when not in a room.
    Leave {
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Snapshot of the coordinator state.
    GetState {
        respond_to: oneshot::Sender<MeshState>,
    },
}

/// Notification posted by a store listener or transport sink.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone)]
pub enum SessionEventKind {
    /// Current member ids of the room (sorted).
    MembersChanged(Vec<String>),

    /// An offer addressed to the local peer, with its store key.
    OfferReceived { key: String, record: DescriptionRecord },

    /// Event for one connection. Dropped unless `epoch` matches the live
    /// connection to `peer_id`.
    Connection {
        peer_id: String,
        epoch: u64,
        event: ConnectionEvent,
    },
}

/// Per-connection event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Answer(DescriptionRecord),
    RemoteCandidate(CandidateRecord),
    Transport(TransportEvent),
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub room_id: String,
    pub peer_id: String,
    /// Committed member ids, including the local peer.
    pub members: Vec<String>,
}

/// Which side of the offer/answer exchange a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The peer with the lexicographically smaller id initiates.
    #[must_use]
    pub fn for_pair(local_peer_id: &str, remote_peer_id: &str) -> Self {
        if local_peer_id < remote_peer_id {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    /// Candidate list this role publishes to.
    #[must_use]
    pub const fn candidate_role(&self) -> CandidateRole {
        match self {
            Role::Initiator => CandidateRole::Caller,
            Role::Responder => CandidateRole::Callee,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    OfferSent,
    OfferReceived,
    DescriptionExchanged,
    Connected,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::OfferSent => "offer_sent",
            ConnectionState::OfferReceived => "offer_received",
            ConnectionState::DescriptionExchanged => "description_exchanged",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The remote peer left the room.
    PeerLeft,
    /// The transport reported failed, disconnected or closed.
    TransportFailed,
    /// Offer/answer/candidate exchange failed locally.
    NegotiationFailed,
    /// Replaced by a newer connection to the same peer.
    Superseded,
    /// The local peer left the room.
    LocalLeave,
    /// The local member record disappeared from the room.
    MembershipLost,
    /// The coordinator was cancelled.
    Shutdown,
}

impl TeardownReason {
    /// Returns the reason as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::PeerLeft => "peer_left",
            TeardownReason::TransportFailed => "transport_failed",
            TeardownReason::NegotiationFailed => "negotiation_failed",
            TeardownReason::Superseded => "superseded",
            TeardownReason::LocalLeave => "local_leave",
            TeardownReason::MembershipLost => "membership_lost",
            TeardownReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification to the UI and audio collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Joined {
        room_id: String,
        peer_id: String,
        members: Vec<String>,
    },
    MembershipChanged {
        room_id: String,
        members: Vec<String>,
    },
    PeerConnected {
        peer_id: String,
    },
    /// Attach the remote audio stream to an output.
    RemoteStreamAdded {
        peer_id: String,
    },
    /// Detach the remote audio output. Emitted once per torn down connection.
    RemoteStreamRemoved {
        peer_id: String,
        reason: TeardownReason,
    },
    Left {
        room_id: String,
    },
}

/// Snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: String,
    pub pair_key: String,
    pub role: Role,
    pub state: ConnectionState,
}

/// Snapshot of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshState {
    pub room_id: Option<String>,
    pub local_peer_id: Option<String>,
    pub members: Vec<String>,
    /// Sorted by peer id.
    pub connections: Vec<ConnectionInfo>,
    pub room_cleanup_armed: bool,
}

impl MeshState {
    #[must_use]
    pub fn connection(&self, peer_id: &str) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| c.peer_id == peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_designation_is_antisymmetric() {
        assert_eq!(Role::for_pair("alice", "bob"), Role::Initiator);
        assert_eq!(Role::for_pair("bob", "alice"), Role::Responder);
        assert_eq!(Role::for_pair("B", "a"), Role::Initiator);
    }

    #[test]
    fn test_role_candidate_lists() {
        assert_eq!(Role::Initiator.candidate_role(), CandidateRole::Caller);
        assert_eq!(Role::Responder.candidate_role(), CandidateRole::Callee);
    }

    #[test]
    fn test_labels() {
        assert_eq!(TeardownReason::PeerLeft.as_str(), "peer_left");
        assert_eq!(TeardownReason::Shutdown.to_string(), "shutdown");
        assert_eq!(TeardownReason::MembershipLost.as_str(), "membership_lost");
        assert_eq!(ConnectionState::DescriptionExchanged.as_str(), "description_exchanged");
        assert_eq!(Role::Responder.to_string(), "responder");
    }

    #[test]
    fn test_state_lookup() {
        let state = MeshState {
            connections: vec![ConnectionInfo {
                peer_id: "b".to_string(),
                pair_key: "a~b".to_string(),
                role: Role::Initiator,
                state: ConnectionState::OfferSent,
            }],
            ..MeshState::default()
        };
        assert!(state.connection("b").is_some());
        assert!(state.connection("c").is_none());
    }
}
