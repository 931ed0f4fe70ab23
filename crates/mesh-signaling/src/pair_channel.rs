//! Per-pair signaling channel.
//!
//! Offers, answers and trickled candidates for one pair of peers live under a
//! deterministic [`PairKey`]. Writers never update a record in place: offers
//! and answers are written once and deleted by their consumer, candidates are
//! appended under store-generated ordered keys and cleared in bulk.
//!
//! Subscriptions decode records before handing them on. Malformed records are
//! dropped at `debug`; they are protocol noise, not errors.

use crate::observability::metrics;
use crate::store::{paths, Listener, SignalingStore, StoreEvent, StoreError, Subscription};
use crate::transport::{IceCandidate, SessionDescription};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Separator between the two escaped ids of a pair key.
const PAIR_SEPARATOR: char = '~';

/// Deterministic identifier of the signaling channel between two peers.
///
/// `PairKey::new(from, to)` escapes both ids and joins them with `~`.
/// Escaped ids never contain `~`, so distinct `(from, to)` pairs always yield
/// distinct keys, and the result is always a valid store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey(String);

impl PairKey {
    #[must_use]
    pub fn new(from: &str, to: &str) -> Self {
        let mut key = String::with_capacity(from.len() + to.len() + 1);
        escape_into(&mut key, from);
        key.push(PAIR_SEPARATOR);
        escape_into(&mut key, to);
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_into(out: &mut String, id: &str) {
    for c in id.chars() {
        let needs_escape = c == '%'
            || c == PAIR_SEPARATOR
            || paths::RESERVED_KEY_CHARS.contains(&c)
            || c.is_control();
        if needs_escape {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(c);
        }
    }
}

/// Which side of a pair published a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateRole {
    /// Candidates published by the initiator.
    Caller,
    /// Candidates published by the responder.
    Callee,
}

impl CandidateRole {
    /// Store collection holding this role's candidates.
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            CandidateRole::Caller => "callerCandidates",
            CandidateRole::Callee => "calleeCandidates",
        }
    }

    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            CandidateRole::Caller => CandidateRole::Callee,
            CandidateRole::Callee => CandidateRole::Caller,
        }
    }
}

/// Offer or answer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionRecord {
    pub from: String,
    pub to: String,
    pub description: SessionDescription,
    pub created_at: i64,
    /// On answers, the `createdAt` of the offer being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_created_at: Option<i64>,
}

impl DescriptionRecord {
    #[must_use]
    pub fn new(from: &str, to: &str, description: SessionDescription) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            description,
            created_at: crate::admission::now_millis(),
            offer_created_at: None,
        }
    }

    /// Tie an answer to the offer it answers.
    #[must_use]
    pub fn answering(mut self, offer_created_at: i64) -> Self {
        self.offer_created_at = Some(offer_created_at);
        self
    }

    /// Whether this record answers the offer created at `offer_created_at`.
    #[must_use]
    pub fn answers_offer(&self, offer_created_at: i64) -> bool {
        self.offer_created_at == Some(offer_created_at)
    }

    /// Whether `peer_id` is either endpoint of this record.
    #[must_use]
    pub fn involves(&self, peer_id: &str) -> bool {
        self.from == peer_id || self.to == peer_id
    }
}

/// Trickled candidate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub owner: String,
    pub candidate: IceCandidate,
    pub created_at: i64,
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, value: Option<Value>) -> Option<T> {
    let value = value?;
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!(
                target: "mesh.pair_channel",
                path = %path,
                error = %e,
                "Ignoring malformed signaling record"
            );
            None
        }
    }
}

/// Signaling records of one room.
#[derive(Clone)]
pub struct PairChannel {
    store: Arc<dyn SignalingStore>,
    room_id: String,
}

impl PairChannel {
    #[must_use]
    pub fn new(store: Arc<dyn SignalingStore>, room_id: impl Into<String>) -> Self {
        Self {
            store,
            room_id: room_id.into(),
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn publish_offer(
        &self,
        pair_key: &PairKey,
        record: &DescriptionRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .write(&paths::offer(&self.room_id, pair_key.as_str()), value)
            .await
    }

    pub async fn publish_answer(
        &self,
        pair_key: &PairKey,
        record: &DescriptionRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .write(&paths::answer(&self.room_id, pair_key.as_str()), value)
            .await
    }

    /// Observe offers addressed to `my_id`.
    ///
    /// The handler receives the record's store key along with the record so
    /// the caller can check it against the recomputed pair key.
    pub async fn subscribe_offers_addressed_to<F>(
        &self,
        my_id: &str,
        handler: F,
    ) -> Result<Subscription, StoreError>
    where
        F: Fn(String, DescriptionRecord) + Send + Sync + 'static,
    {
        let my_id = my_id.to_string();
        let listener: Listener = Arc::new(move |event: StoreEvent| {
            let Some(key) = event.key else {
                return;
            };
            let Some(record) = decode::<DescriptionRecord>(&event.path, event.value) else {
                return;
            };
            if record.to == my_id {
                handler(key, record);
            }
        });
        self.store
            .on_child_appended(&paths::offers(&self.room_id), listener)
            .await
    }

    /// Observe the answer for one pair. Only present, well-formed records are
    /// delivered.
    pub async fn subscribe_answer<F>(
        &self,
        pair_key: &PairKey,
        handler: F,
    ) -> Result<Subscription, StoreError>
    where
        F: Fn(DescriptionRecord) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(move |event: StoreEvent| {
            if let Some(record) = decode::<DescriptionRecord>(&event.path, event.value) {
                handler(record);
            }
        });
        self.store
            .on_value_changed(&paths::answer(&self.room_id, pair_key.as_str()), listener)
            .await
    }

    /// Observe candidates published under `role` for one pair, in publish order.
    pub async fn subscribe_candidates<F>(
        &self,
        pair_key: &PairKey,
        role: CandidateRole,
        handler: F,
    ) -> Result<Subscription, StoreError>
    where
        F: Fn(CandidateRecord) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(move |event: StoreEvent| {
            if let Some(record) = decode::<CandidateRecord>(&event.path, event.value) {
                handler(record);
            }
        });
        self.store
            .on_child_appended(
                &paths::candidates(&self.room_id, role.collection(), pair_key.as_str()),
                listener,
            )
            .await
    }

    /// Append a local candidate under `role`'s list. Returns the generated key.
    pub async fn publish_candidate(
        &self,
        pair_key: &PairKey,
        role: CandidateRole,
        owner: &str,
        candidate: IceCandidate,
    ) -> Result<String, StoreError> {
        let record = CandidateRecord {
            owner: owner.to_string(),
            candidate,
            created_at: crate::admission::now_millis(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .append_unique(
                &paths::candidates(&self.room_id, role.collection(), pair_key.as_str()),
                value,
            )
            .await
    }

    pub async fn clear_offer(&self, pair_key: &PairKey) {
        self.best_effort_delete(&paths::offer(&self.room_id, pair_key.as_str()), "clear_offer")
            .await;
    }

    pub async fn clear_answer(&self, pair_key: &PairKey) {
        self.best_effort_delete(&paths::answer(&self.room_id, pair_key.as_str()), "clear_answer")
            .await;
    }

    /// Delete both candidate lists of a pair.
    pub async fn clear_candidates(&self, pair_key: &PairKey) {
        for role in [CandidateRole::Caller, CandidateRole::Callee] {
            self.best_effort_delete(
                &paths::candidates(&self.room_id, role.collection(), pair_key.as_str()),
                "clear_candidates",
            )
            .await;
        }
    }

    /// Delete every offer and answer that names `peer_id` as an endpoint.
    pub async fn clear_records_for_peer(&self, peer_id: &str) {
        for collection in [paths::offers(&self.room_id), paths::answers(&self.room_id)] {
            let records = match self.store.read(&collection).await {
                Ok(Some(Value::Object(records))) => records,
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        target: "mesh.pair_channel",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Failed to read signaling records for cleanup"
                    );
                    metrics::record_cleanup_failure("clear_peer_records");
                    continue;
                }
            };

            for (key, raw) in records {
                let path = format!("{collection}/{key}");
                let involved = decode::<DescriptionRecord>(&path, Some(raw))
                    .is_some_and(|record| record.involves(peer_id));
                if involved {
                    self.best_effort_delete(&path, "clear_peer_records").await;
                }
            }
        }
    }

    async fn best_effort_delete(&self, path: &str, operation: &'static str) {
        if let Err(e) = self.store.delete(path).await {
            warn!(
                target: "mesh.pair_channel",
                room_id = %self.room_id,
                path = %path,
                error = %e,
                "Best-effort signaling cleanup failed"
            );
            metrics::record_cleanup_failure(operation);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pair_key_is_deterministic() {
        assert_eq!(PairKey::new("alice", "bob"), PairKey::new("alice", "bob"));
        assert_eq!(PairKey::new("alice", "bob").as_str(), "alice~bob");
        assert_ne!(PairKey::new("alice", "bob"), PairKey::new("bob", "alice"));
    }

    #[test]
    fn test_pair_key_is_injective_across_separator() {
        // Naive concatenation would collide on these.
        let left = PairKey::new("a~b", "c");
        let right = PairKey::new("a", "b~c");
        assert_ne!(left, right);
        assert_eq!(left.as_str(), "a%7Eb~c");
        assert_eq!(right.as_str(), "a~b%7Ec");

        // An id that already looks escaped is escaped again.
        assert_ne!(PairKey::new("a%7Eb", "c"), left);
        assert_eq!(PairKey::new("a%7Eb", "c").as_str(), "a%257Eb~c");
    }

    #[test]
    fn test_pair_key_is_valid_store_key() {
        let key = PairKey::new("user.one/$x", "#[two]\n");
        assert!(paths::is_valid_key(key.as_str()), "{key}");
        assert_eq!(key.as_str(), "user%2Eone%2F%24x~%23%5Btwo%5D%0A");
    }

    #[test]
    fn test_pair_key_preserves_unicode() {
        assert_eq!(PairKey::new("zoë", "李").as_str(), "zoë~李");
    }

    #[test]
    fn test_candidate_role_collections() {
        assert_eq!(CandidateRole::Caller.collection(), "callerCandidates");
        assert_eq!(CandidateRole::Callee.collection(), "calleeCandidates");
        assert_eq!(CandidateRole::Caller.opposite(), CandidateRole::Callee);
    }

    #[test]
    fn test_description_record_wire_format() {
        let record = DescriptionRecord {
            from: "a".to_string(),
            to: "b".to_string(),
            description: SessionDescription::offer("v=0"),
            created_at: 42,
            offer_created_at: None,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "from": "a",
                "to": "b",
                "description": {"type": "offer", "sdp": "v=0"},
                "createdAt": 42
            })
        );
        assert!(record.involves("a"));
        assert!(record.involves("b"));
        assert!(!record.involves("c"));
    }

    #[test]
    fn test_answer_carries_offer_reference() {
        let answer = DescriptionRecord::new("b", "a", SessionDescription::answer("v=0")).answering(42);
        assert!(answer.answers_offer(42));
        assert!(!answer.answers_offer(43));
        assert_eq!(serde_json::to_value(&answer).unwrap()["offerCreatedAt"], json!(42));

        // Records written without the reference still decode, and match nothing
        let legacy: DescriptionRecord = serde_json::from_value(json!({
            "from": "b",
            "to": "a",
            "description": {"type": "answer", "sdp": "v=0"},
            "createdAt": 7
        }))
        .unwrap();
        assert_eq!(legacy.offer_created_at, None);
        assert!(!legacy.answers_offer(7));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode::<DescriptionRecord>("p", Some(json!({"from": "a"}))).is_none());
        assert!(decode::<DescriptionRecord>("p", None).is_none());
        let candidate: Option<CandidateRecord> = decode(
            "p",
            Some(json!({"owner": "a", "candidate": {"candidate": "c1"}, "createdAt": 1})),
        );
        assert_eq!(candidate.unwrap().candidate, IceCandidate::new("c1"));
    }
}
