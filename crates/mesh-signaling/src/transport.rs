//! Media transport collaborator contract.
//!
//! Creating offers/answers, gathering candidates and running ICE are provided
//! by the host's real-time media stack. This crate only drives them through
//! [`PeerTransport`], and receives notifications through a
//! [`TransportEventSink`] handed to [`TransportFactory::create`].
//!
//! The wire types serialize the same way browser `RTCSessionDescriptionInit`
//! and `RTCIceCandidateInit` objects do, so records written by other clients
//! of the same store decode unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transport error type.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Creating or applying a session description failed.
    #[error("Session description error: {0}")]
    Description(String),

    /// A remote candidate was rejected.
    #[error("Candidate rejected: {0}")]
    Candidate(String),

    /// The transport is already closed.
    #[error("Transport closed")]
    Closed,

    /// Backend-specific failure.
    #[error("Transport backend error: {0}")]
    Backend(String),
}

/// Session description kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged through the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Connection/ICE state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Connectivity established; candidate lists are no longer needed.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, TransportState::Connected | TransportState::Completed)
    }

    /// Connection lost; triggers teardown (no resume).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }

    /// Returns the state as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Completed => "completed",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate was discovered and should be trickled.
    LocalCandidate(IceCandidate),
    /// Connection/ICE state transition.
    StateChanged(TransportState),
    /// The remote side's audio stream became available.
    RemoteStreamAdded,
}

/// Sink the transport reports events to.
pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// One peer-to-peer media transport.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Detach handlers and release the transport.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates transports, one per remote peer.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_description_wire_format() {
        let offer = SessionDescription::offer("v=0");
        let value = serde_json::to_value(&offer).unwrap();
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0"}));

        let decoded: SessionDescription =
            serde_json::from_value(json!({"type": "answer", "sdp": "v=0 answer"})).unwrap();
        assert_eq!(decoded.sdp_type, SdpType::Answer);
    }

    #[test]
    fn test_candidate_wire_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());

        // Browser clients may send null fields
        let decoded: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:2",
            "sdpMid": null,
            "sdpMLineIndex": null
        }))
        .unwrap();
        assert_eq!(decoded, IceCandidate::new("candidate:2"));
    }

    #[test]
    fn test_state_classification() {
        assert!(TransportState::Connected.is_connected());
        assert!(TransportState::Completed.is_connected());
        assert!(!TransportState::Checking.is_connected());

        assert!(TransportState::Failed.is_terminal());
        assert!(TransportState::Disconnected.is_terminal());
        assert!(TransportState::Closed.is_terminal());
        assert!(!TransportState::New.is_terminal());
        assert_eq!(TransportState::Completed.to_string(), "completed");
    }
}
