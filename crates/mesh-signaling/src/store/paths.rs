//! Persisted layout of a room in the signaling store.
//!
//! # Key Patterns
//!
//! - `rooms/{room}/createdAt` - Room creation timestamp (ms)
//! - `rooms/{room}/members/{peer}` - Member record
//! - `rooms/{room}/offer/{pair}` - Offer record
//! - `rooms/{room}/answer/{pair}` - Answer record
//! - `rooms/{room}/callerCandidates/{pair}/{generated}` - Initiator candidates
//! - `rooms/{room}/calleeCandidates/{pair}/{generated}` - Responder candidates

/// Root collection for rooms.
pub const ROOMS_ROOT: &str = "rooms";

/// Characters the store reserves in keys.
pub const RESERVED_KEY_CHARS: &[char] = &['.', '$', '#', '[', ']', '/'];

/// Whether `key` can be used as a single path segment.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key
            .chars()
            .any(|c| RESERVED_KEY_CHARS.contains(&c) || c.is_control())
}

#[must_use]
pub fn room(room_id: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}")
}

#[must_use]
pub fn room_created_at(room_id: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/createdAt")
}

#[must_use]
pub fn members(room_id: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/members")
}

#[must_use]
pub fn member(room_id: &str, peer_id: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/members/{peer_id}")
}

#[must_use]
pub fn offers(room_id: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/offer")
}

#[must_use]
pub fn offer(room_id: &str, pair_key: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/offer/{pair_key}")
}

#[must_use]
pub fn answers(room_id: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/answer")
}

#[must_use]
pub fn answer(room_id: &str, pair_key: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/answer/{pair_key}")
}

/// Candidate list for one role of one pair.
///
/// `collection` is `callerCandidates` or `calleeCandidates`.
#[must_use]
pub fn candidates(room_id: &str, collection: &str, pair_key: &str) -> String {
    format!("{ROOMS_ROOT}/{room_id}/{collection}/{pair_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_layout() {
        assert_eq!(room("r1"), "rooms/r1");
        assert_eq!(room_created_at("r1"), "rooms/r1/createdAt");
        assert_eq!(members("r1"), "rooms/r1/members");
        assert_eq!(member("r1", "peer-a"), "rooms/r1/members/peer-a");
        assert_eq!(offers("r1"), "rooms/r1/offer");
        assert_eq!(offer("r1", "a~b"), "rooms/r1/offer/a~b");
        assert_eq!(answers("r1"), "rooms/r1/answer");
        assert_eq!(answer("r1", "a~b"), "rooms/r1/answer/a~b");
        assert_eq!(
            candidates("r1", "callerCandidates", "a~b"),
            "rooms/r1/callerCandidates/a~b"
        );
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("peer-a"));
        assert!(is_valid_key("a%2Eb~c"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("a.b"));
        assert!(!is_valid_key("a/b"));
        assert!(!is_valid_key("a#b"));
        assert!(!is_valid_key("a[0]"));
        assert!(!is_valid_key("$a"));
        assert!(!is_valid_key("a\nb"));
    }
}
