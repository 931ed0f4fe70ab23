//! Room admission: transactional creation and capped membership.
//!
//! The capacity invariant (|Members| <= capacity) is enforced only inside the
//! membership transaction, never by post-hoc validation. Everything that is
//! not a transaction here is best-effort: the deferred member removal
//! registered on join is the backstop for presence.
//!
//! # Disconnect cleanup
//!
//! Two deferred actions may be registered per session:
//! - `rooms/{room}/members/{peer}` removal, always, right after join commits
//! - `rooms/{room}` removal, only while the local peer is the sole member
//!
//! The room-level action is armed/disarmed by the coordinator on every
//! membership notification (see [`RoomAdmission::arm_room_cleanup`]).

use crate::errors::MeshError;
use crate::observability::metrics;
use crate::pair_channel::PairChannel;
use crate::store::{paths, DeferredMutation, SignalingStore, TransactionDecision};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Maximum room id length accepted by [`validate_room_id`].
pub const MAX_ROOM_ID_LENGTH: usize = 64;

/// Member record stored at `rooms/{room}/members/{peer}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub peer_id: String,
    pub joined_at: i64,
    pub last_seen: i64,
}

/// Reference to an existing room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRef {
    pub room_id: String,
    /// Creation timestamp, if the room node carries one.
    pub created_at: Option<i64>,
    /// Whether this call created the room.
    pub created: bool,
}

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Check that a room id is usable as a store key and within bounds.
pub fn validate_room_id(room_id: &str) -> Result<(), MeshError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LENGTH
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(MeshError::InvalidRoomId(room_id.to_string()))
    }
}

/// Generate a fresh room id of `length` lowercase hex characters.
#[must_use]
pub fn generate_room_id(length: usize) -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    while id.len() < length {
        id.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    id.truncate(length);
    id
}

/// Decode a members map, skipping malformed entries.
#[must_use]
pub fn parse_members(value: Option<&Value>) -> BTreeMap<String, MemberRecord> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };

    entries
        .iter()
        .filter_map(|(peer_id, raw)| match serde_json::from_value(raw.clone()) {
            Ok(record) => Some((peer_id.clone(), record)),
            Err(e) => {
                debug!(
                    target: "mesh.admission",
                    peer_id = %peer_id,
                    error = %e,
                    "Ignoring malformed member record"
                );
                None
            }
        })
        .collect()
}

/// Number of entries under a members node, well-formed or not.
fn raw_member_count(value: Option<&Value>) -> usize {
    value.and_then(Value::as_object).map_or(0, Map::len)
}

/// Room admission against a signaling store.
#[derive(Clone)]
pub struct RoomAdmission {
    store: Arc<dyn SignalingStore>,
    capacity: usize,
}

impl RoomAdmission {
    #[must_use]
    pub fn new(store: Arc<dyn SignalingStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the room, creating it if absent and `create_if_missing` is set.
    ///
    /// # Errors
    ///
    /// - `RoomNotFound` if absent and `create_if_missing` is false.
    /// - `Store` if the store is unreachable.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn create_or_get_room(
        &self,
        room_id: &str,
        create_if_missing: bool,
    ) -> Result<RoomRef, MeshError> {
        validate_room_id(room_id)?;

        if let Some(existing) = self.store.read(&paths::room(room_id)).await? {
            return Ok(RoomRef {
                room_id: room_id.to_string(),
                created_at: existing.get("createdAt").and_then(Value::as_i64),
                created: false,
            });
        }

        if !create_if_missing {
            return Err(MeshError::RoomNotFound(room_id.to_string()));
        }

        match self.create_room(room_id).await {
            Ok(room) => Ok(room),
            Err(MeshError::RoomAlreadyExists(_)) => {
                // Lost the creation race; the winner's room is what we join.
                debug!(
                    target: "mesh.admission",
                    room_id = %room_id,
                    "Room created concurrently, proceeding with existing room"
                );
                Ok(RoomRef {
                    room_id: room_id.to_string(),
                    created_at: None,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Create the room only if it is absent at commit time.
    ///
    /// # Errors
    ///
    /// `RoomAlreadyExists` if another client created it first.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn create_room(&self, room_id: &str) -> Result<RoomRef, MeshError> {
        validate_room_id(room_id)?;

        let created_at = now_millis();
        let started = Instant::now();
        let outcome = self
            .store
            .transact(
                &paths::room(room_id),
                Box::new(move |current| match current {
                    None => TransactionDecision::Commit(Some(json!({ "createdAt": created_at }))),
                    Some(_) => TransactionDecision::Abort,
                }),
            )
            .await?;
        metrics::record_transaction_duration("create_room", started.elapsed());

        if !outcome.committed {
            return Err(MeshError::RoomAlreadyExists(room_id.to_string()));
        }

        info!(target: "mesh.admission", room_id = %room_id, "Room created");
        Ok(RoomRef {
            room_id: room_id.to_string(),
            created_at: Some(created_at),
            created: true,
        })
    }

    /// Admit `peer_id` to the room, respecting capacity.
    ///
    /// Idempotent for a peer that is already a member. On success the
    /// member's `lastSeen` is refreshed and a deferred removal of its record
    /// is registered. Returns the committed member ids, sorted.
    ///
    /// The transaction runs on the room node so a room deleted since
    /// `create_or_get_room` is never recreated without its `createdAt`.
    ///
    /// # Errors
    ///
    /// - `RoomFull` if the room holds `capacity` members at commit time.
    /// - `RoomNotFound` if the room node is gone at commit time.
    /// - `Store` if post-commit registration fails; a newly inserted member
    ///   record is removed again before returning.
    #[instrument(skip_all, fields(room_id = %room_id, peer_id = %peer_id))]
    pub async fn join_room(&self, room_id: &str, peer_id: &str) -> Result<Vec<String>, MeshError> {
        validate_room_id(room_id)?;
        if !paths::is_valid_key(peer_id) {
            return Err(MeshError::Internal(format!("invalid peer id: {peer_id}")));
        }

        let capacity = self.capacity;
        let candidate_peer = peer_id.to_string();
        let was_member = Arc::new(AtomicBool::new(false));
        let was_member_in_txn = Arc::clone(&was_member);
        let room_missing = Arc::new(AtomicBool::new(false));
        let room_missing_in_txn = Arc::clone(&room_missing);
        let started = Instant::now();
        let outcome = self
            .store
            .transact(
                &paths::room(room_id),
                Box::new(move |current| {
                    let room = match current {
                        Some(Value::Object(room)) if room.contains_key("createdAt") => room,
                        _ => {
                            room_missing_in_txn.store(true, Ordering::SeqCst);
                            return TransactionDecision::Abort;
                        }
                    };
                    room_missing_in_txn.store(false, Ordering::SeqCst);

                    let mut members = match room.get("members") {
                        Some(Value::Object(map)) => map.clone(),
                        _ => Map::new(),
                    };

                    let present = members.contains_key(&candidate_peer);
                    was_member_in_txn.store(present, Ordering::SeqCst);
                    if present {
                        return TransactionDecision::Commit(current.cloned());
                    }
                    if members.len() >= capacity {
                        return TransactionDecision::Abort;
                    }

                    let now = now_millis();
                    let record = MemberRecord {
                        peer_id: candidate_peer.clone(),
                        joined_at: now,
                        last_seen: now,
                    };
                    match serde_json::to_value(record) {
                        Ok(value) => {
                            members.insert(candidate_peer.clone(), value);
                            let mut room = room.clone();
                            room.insert("members".to_string(), Value::Object(members));
                            TransactionDecision::Commit(Some(Value::Object(room)))
                        }
                        Err(_) => TransactionDecision::Abort,
                    }
                }),
            )
            .await
            .inspect_err(|_| metrics::record_admission("error"))?;
        metrics::record_transaction_duration("join_room", started.elapsed());

        let members_value = outcome.value.as_ref().and_then(|room| room.get("members"));

        if !outcome.committed {
            if room_missing.load(Ordering::SeqCst) {
                debug!(
                    target: "mesh.admission",
                    room_id = %room_id,
                    peer_id = %peer_id,
                    "Join rejected, room no longer exists"
                );
                metrics::record_admission("room_not_found");
                return Err(MeshError::RoomNotFound(room_id.to_string()));
            }

            // Raw entry count: a malformed record still occupies a slot.
            let member_count = raw_member_count(members_value);
            if member_count >= capacity {
                warn!(
                    target: "mesh.admission",
                    room_id = %room_id,
                    peer_id = %peer_id,
                    member_count = member_count,
                    capacity = capacity,
                    "Join rejected, room is full"
                );
                metrics::record_admission("room_full");
                return Err(MeshError::RoomFull(room_id.to_string()));
            }
            metrics::record_admission("error");
            return Err(MeshError::Internal(format!(
                "membership transaction aborted for room {room_id}"
            )));
        }

        let members = parse_members(members_value);
        if !members.contains_key(peer_id) {
            metrics::record_admission("error");
            return Err(MeshError::Internal(format!(
                "membership commit for room {room_id} does not include {peer_id}"
            )));
        }

        if let Err(e) = self.register_presence(room_id, peer_id).await {
            warn!(
                target: "mesh.admission",
                room_id = %room_id,
                peer_id = %peer_id,
                error = %e,
                "Post-join registration failed"
            );
            if !was_member.load(Ordering::SeqCst) {
                self.remove_member_record(room_id, peer_id).await;
            }
            metrics::record_admission("error");
            return Err(e);
        }

        info!(
            target: "mesh.admission",
            room_id = %room_id,
            peer_id = %peer_id,
            member_count = members.len(),
            "Joined room"
        );
        metrics::record_admission(if was_member.load(Ordering::SeqCst) {
            "rejoined"
        } else {
            "joined"
        });

        Ok(members.into_keys().collect())
    }

    /// Post-commit: last-seen refresh, then the disconnect backstop.
    async fn register_presence(&self, room_id: &str, peer_id: &str) -> Result<(), MeshError> {
        self.refresh_last_seen(room_id, peer_id).await?;
        self.store
            .defer_on_disconnect(&paths::member(room_id, peer_id), DeferredMutation::Remove)
            .await?;
        Ok(())
    }

    /// Undo a committed join whose backstop could not be registered.
    async fn remove_member_record(&self, room_id: &str, peer_id: &str) {
        if let Err(e) = self.store.delete(&paths::member(room_id, peer_id)).await {
            warn!(
                target: "mesh.admission",
                room_id = %room_id,
                peer_id = %peer_id,
                error = %e,
                "Failed to roll back member record"
            );
            metrics::record_cleanup_failure("remove_member");
        }
    }

    /// Best-effort departure. Never fails; the deferred removal registered on
    /// join covers anything that could not be done here.
    #[instrument(skip_all, fields(room_id = %room_id, peer_id = %peer_id))]
    pub async fn leave_room(&self, room_id: &str, peer_id: &str) {
        let member_path = paths::member(room_id, peer_id);

        if let Err(e) = self.store.delete(&member_path).await {
            warn!(
                target: "mesh.admission",
                room_id = %room_id,
                peer_id = %peer_id,
                error = %e,
                "Failed to remove member record, relying on disconnect cleanup"
            );
            metrics::record_cleanup_failure("remove_member");
        } else if let Err(e) = self.store.cancel_deferred(&member_path).await {
            // Only cancel once the record is gone, otherwise the backstop stays armed.
            debug!(
                target: "mesh.admission",
                error = %e,
                "Failed to cancel deferred member removal"
            );
            metrics::record_cleanup_failure("cancel_deferred");
        }

        self.disarm_room_cleanup(room_id).await;

        PairChannel::new(Arc::clone(&self.store), room_id)
            .clear_records_for_peer(peer_id)
            .await;

        info!(target: "mesh.admission", room_id = %room_id, peer_id = %peer_id, "Left room");
    }

    /// Delete the room subtree if it has no members.
    ///
    /// Runs as a transaction on the room node so a peer admitted in the
    /// meantime is never deleted. Returns whether the room was removed.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn remove_room_if_empty(&self, room_id: &str) -> Result<bool, MeshError> {
        let started = Instant::now();
        let outcome = self
            .store
            .transact(
                &paths::room(room_id),
                Box::new(|current| match current {
                    Some(room) if parse_members(room.get("members")).is_empty() => {
                        TransactionDecision::Commit(None)
                    }
                    _ => TransactionDecision::Abort,
                }),
            )
            .await?;
        metrics::record_transaction_duration("remove_room", started.elapsed());

        if outcome.committed {
            info!(target: "mesh.admission", room_id = %room_id, "Removed empty room");
        }
        Ok(outcome.committed)
    }

    /// Update the member's `lastSeen` timestamp.
    ///
    /// Only touches an existing record: a partial record written after the
    /// member was removed would count against capacity. Returns whether the
    /// record was present.
    pub async fn refresh_last_seen(&self, room_id: &str, peer_id: &str) -> Result<bool, MeshError> {
        let outcome = self
            .store
            .transact(
                &paths::member(room_id, peer_id),
                Box::new(|current| match current {
                    Some(Value::Object(record)) => {
                        let mut record = record.clone();
                        record.insert("lastSeen".to_string(), json!(now_millis()));
                        TransactionDecision::Commit(Some(Value::Object(record)))
                    }
                    _ => TransactionDecision::Abort,
                }),
            )
            .await?;

        if !outcome.committed {
            debug!(
                target: "mesh.admission",
                room_id = %room_id,
                peer_id = %peer_id,
                "Member record missing, lastSeen not refreshed"
            );
        }
        Ok(outcome.committed)
    }

    /// Arm deletion of the whole room if this client disconnects.
    ///
    /// Only called while the local peer is the sole member.
    pub async fn arm_room_cleanup(&self, room_id: &str) -> Result<(), MeshError> {
        self.store
            .defer_on_disconnect(&paths::room(room_id), DeferredMutation::Remove)
            .await?;
        debug!(target: "mesh.admission", room_id = %room_id, "Armed room disconnect cleanup");
        Ok(())
    }

    /// Cancel a previously armed room deletion. Best-effort.
    pub async fn disarm_room_cleanup(&self, room_id: &str) {
        match self.store.cancel_deferred(&paths::room(room_id)).await {
            Ok(()) => {
                debug!(target: "mesh.admission", room_id = %room_id, "Disarmed room disconnect cleanup");
            }
            Err(e) => {
                warn!(
                    target: "mesh.admission",
                    room_id = %room_id,
                    error = %e,
                    "Failed to disarm room disconnect cleanup"
                );
                metrics::record_cleanup_failure("cancel_deferred");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("r1").is_ok());
        assert!(validate_room_id("team_standup-42").is_ok());
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LENGTH)).is_ok());

        for bad in ["", "a/b", "a.b", "room#1", "sp ace", "ü"] {
            assert!(
                matches!(validate_room_id(bad), Err(MeshError::InvalidRoomId(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_generate_room_id() {
        let id = generate_room_id(8);
        assert_eq!(id.len(), 8);
        assert!(validate_room_id(&id).is_ok());

        let long = generate_room_id(40);
        assert_eq!(long.len(), 40);
        assert_ne!(generate_room_id(8), generate_room_id(8));
    }

    #[test]
    fn test_parse_members_skips_malformed() {
        let value = json!({
            "peer-a": {"peerId": "peer-a", "joinedAt": 1, "lastSeen": 2},
            "peer-b": {"unexpected": true},
        });
        let members = parse_members(Some(&value));
        assert_eq!(members.len(), 1);
        assert_eq!(members["peer-a"].last_seen, 2);

        assert!(parse_members(None).is_empty());
        assert!(parse_members(Some(&json!("not an object"))).is_empty());
    }

    #[test]
    fn test_raw_member_count_includes_malformed_entries() {
        let value = json!({
            "peer-a": {"peerId": "peer-a", "joinedAt": 1, "lastSeen": 2},
            "peer-b": "garbage",
        });
        assert_eq!(raw_member_count(Some(&value)), 2);
        assert_eq!(parse_members(Some(&value)).len(), 1);
        assert_eq!(raw_member_count(None), 0);
    }

    #[test]
    fn test_member_record_wire_format() {
        let record = MemberRecord {
            peer_id: "peer-a".to_string(),
            joined_at: 10,
            last_seen: 11,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"peerId": "peer-a", "joinedAt": 10, "lastSeen": 11})
        );
    }
}
