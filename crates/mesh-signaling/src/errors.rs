//! Mesh signaling error types.
//!
//! Error types map to the string codes consumed by the caller that drives UI.
//! Internal details are logged but not exposed through `client_message()`.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

/// Code for errors that are not part of the admission/lifecycle taxonomy.
pub const INTERNAL_ERROR_CODE: &str = "internal";

/// Mesh signaling error type.
///
/// Maps to boundary error codes:
/// - `RoomNotFound`: `room-not-found`
/// - `RoomFull`: `room-full`
/// - `RoomAlreadyExists`: `room-already-exists`
/// - `AlreadyInRoom`: `already-in-room`
/// - `InvalidRoomId`: `invalid-room-id`
/// - Store, Transport, Config, Internal: `internal`
#[derive(Debug, Error)]
pub enum MeshError {
    /// The room does not exist and creation was not requested.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room already holds the maximum number of members.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// Strict creation found the room already present.
    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    /// A session is already active on this coordinator.
    #[error("Already in room: {0}")]
    AlreadyInRoom(String),

    /// Room identifier is empty, too long, or uses reserved characters.
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    /// Signaling store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Media transport operation failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error (actor channel closed, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Returns the boundary error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::RoomNotFound(_) => "room-not-found",
            MeshError::RoomFull(_) => "room-full",
            MeshError::RoomAlreadyExists(_) => "room-already-exists",
            MeshError::AlreadyInRoom(_) => "already-in-room",
            MeshError::InvalidRoomId(_) => "invalid-room-id",
            MeshError::Store(_)
            | MeshError::Transport(_)
            | MeshError::Config(_)
            | MeshError::Internal(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Returns a caller-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            MeshError::RoomNotFound(_) => "Room not found".to_string(),
            MeshError::RoomFull(_) => "Room is full".to_string(),
            MeshError::RoomAlreadyExists(_) => "Room already exists".to_string(),
            MeshError::AlreadyInRoom(_) => "Already in a room, leave it first".to_string(),
            MeshError::InvalidRoomId(_) => "Invalid room id".to_string(),
            MeshError::Store(_)
            | MeshError::Transport(_)
            | MeshError::Config(_)
            | MeshError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether this error belongs to the admission taxonomy (never retried
    /// automatically).
    #[must_use]
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            MeshError::RoomNotFound(_)
                | MeshError::RoomFull(_)
                | MeshError::RoomAlreadyExists(_)
                | MeshError::AlreadyInRoom(_)
                | MeshError::InvalidRoomId(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            MeshError::RoomNotFound("r1".to_string()).error_code(),
            "room-not-found"
        );
        assert_eq!(MeshError::RoomFull("r1".to_string()).error_code(), "room-full");
        assert_eq!(
            MeshError::RoomAlreadyExists("r1".to_string()).error_code(),
            "room-already-exists"
        );
        assert_eq!(
            MeshError::AlreadyInRoom("r1".to_string()).error_code(),
            "already-in-room"
        );
        assert_eq!(
            MeshError::InvalidRoomId("a/b".to_string()).error_code(),
            "invalid-room-id"
        );

        // Everything else is internal
        assert_eq!(
            MeshError::Store(StoreError::Unavailable("offline".to_string())).error_code(),
            INTERNAL_ERROR_CODE
        );
        assert_eq!(
            MeshError::Transport(TransportError::Closed).error_code(),
            INTERNAL_ERROR_CODE
        );
        assert_eq!(
            MeshError::Internal("mailbox closed".to_string()).error_code(),
            INTERNAL_ERROR_CODE
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err =
            MeshError::Store(StoreError::Backend("connection refused at 10.1.2.3".to_string()));
        assert!(!store_err.client_message().contains("10.1"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let full = MeshError::RoomFull("room-abc".to_string());
        assert_eq!(full.client_message(), "Room is full");
    }

    #[test]
    fn test_admission_errors_are_classified() {
        assert!(MeshError::RoomFull("r".to_string()).is_admission_error());
        assert!(MeshError::RoomNotFound("r".to_string()).is_admission_error());
        assert!(!MeshError::Internal("x".to_string()).is_admission_error());
        assert!(!MeshError::Transport(TransportError::Closed).is_admission_error());
    }

    #[test]
    fn test_config_error_conversion() {
        let mesh_err: MeshError =
            ConfigError::InvalidValue("MESH_ROOM_CAPACITY must be between 2 and 4".to_string())
                .into();
        assert!(matches!(mesh_err, MeshError::Config(_)));
        assert_eq!(mesh_err.error_code(), INTERNAL_ERROR_CODE);
        assert!(!mesh_err.is_admission_error());
        assert_eq!(mesh_err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", MeshError::RoomFull("r1".to_string())),
            "Room is full: r1"
        );
        assert_eq!(
            format!(
                "{}",
                MeshError::Store(StoreError::Unavailable("client disconnected".to_string()))
            ),
            "Store error: Store unavailable: client disconnected"
        );
    }
}
