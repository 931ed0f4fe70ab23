//! Mesh coordinator configuration.
//!
//! Configuration is loaded from environment variables with defaults for
//! everything; only malformed values are errors.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Hard upper bound on room membership. Full mesh is O(n²) connections.
pub const MAX_ROOM_CAPACITY: usize = 4;

/// Smallest room that still forms a mesh.
pub const MIN_ROOM_CAPACITY: usize = 2;

/// Default length of generated room ids.
pub const DEFAULT_ROOM_ID_LENGTH: usize = 8;

/// Default presence refresh interval in seconds.
pub const DEFAULT_PRESENCE_REFRESH_SECONDS: u64 = 30;

/// Default capacity of the `MeshEvent` broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Mesh coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Maximum members per room (2..=4, default 4).
    pub room_capacity: usize,

    /// Fixed local peer id. `None` generates a fresh v4 UUID per session.
    pub peer_id: Option<String>,

    /// Length of generated room ids (4..=32, default 8).
    pub room_id_length: usize,

    /// Interval between `lastSeen` refreshes. Zero disables the heartbeat.
    pub presence_refresh_interval: Duration,

    /// Capacity of the `MeshEvent` broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            room_capacity: MAX_ROOM_CAPACITY,
            peer_id: None,
            room_id_length: DEFAULT_ROOM_ID_LENGTH,
            presence_refresh_interval: Duration::from_secs(DEFAULT_PRESENCE_REFRESH_SECONDS),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl MeshConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let room_capacity = parse_var(vars, "MESH_ROOM_CAPACITY")?.unwrap_or(defaults.room_capacity);
        if !(MIN_ROOM_CAPACITY..=MAX_ROOM_CAPACITY).contains(&room_capacity) {
            return Err(ConfigError::InvalidValue(format!(
                "MESH_ROOM_CAPACITY must be between {MIN_ROOM_CAPACITY} and {MAX_ROOM_CAPACITY}, got {room_capacity}"
            )));
        }

        let peer_id = vars
            .get("MESH_PEER_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(id) = &peer_id {
            if !crate::store::paths::is_valid_key(id) {
                return Err(ConfigError::InvalidValue(format!(
                    "MESH_PEER_ID contains reserved characters: {id}"
                )));
            }
        }

        let room_id_length =
            parse_var(vars, "MESH_ROOM_ID_LENGTH")?.unwrap_or(defaults.room_id_length);
        if !(4..=32).contains(&room_id_length) {
            return Err(ConfigError::InvalidValue(format!(
                "MESH_ROOM_ID_LENGTH must be between 4 and 32, got {room_id_length}"
            )));
        }

        let presence_refresh_interval = parse_var::<u64>(vars, "MESH_PRESENCE_REFRESH_SECONDS")?
            .map_or(defaults.presence_refresh_interval, Duration::from_secs);

        let event_channel_capacity = parse_var(vars, "MESH_EVENT_CHANNEL_CAPACITY")?
            .unwrap_or(defaults.event_channel_capacity);
        if event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_EVENT_CHANNEL_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(MeshConfig {
            room_capacity,
            peer_id,
            room_id_length,
            presence_refresh_interval,
            event_channel_capacity,
        })
    }

    /// Builder-style override of the local peer id.
    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{name} is not a valid number: {raw}"))),
    }
}
