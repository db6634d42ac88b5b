//! The abstract digest interface events are hashed and identified through.
//!
//! This crate never implements a hash function itself (spec Non-goals: "no
//! cryptographic primitive implementation"); `evm-auth` provides the default
//! SHA-256 implementation and any embedder may supply another.

use base64::Engine;

use crate::event::Event;
use crate::id::{EventId, IdError, ServerName};

/// A pluggable content digest, invoked by [`reference_hash`] over an event's
/// canonical bytes.
pub trait Digest {
    /// The digest's output, as raw bytes.
    fn digest(&self, bytes: &[u8]) -> Vec<u8>;

    /// The algorithm name this digest is registered under in
    /// `Event::hashes` (e.g. `"sha256"`).
    fn algorithm_name(&self) -> &'static str;
}

/// `reference_hash(event) → digest`: the chosen digest over
/// `Event::canonical_bytes`, with `signatures`, `hashes`, and `unsigned`
/// already excluded by `canonical_bytes` itself.
pub fn reference_hash(event: &Event, digest: &dyn Digest) -> Result<Vec<u8>, serde_json::Error> {
    let bytes = event.canonical_bytes()?;
    Ok(digest.digest(&bytes))
}

/// `make_id(event, digest) → event_id`: forms `$<base64(digest)>:<origin>`.
pub fn make_id(origin: &ServerName, digest_bytes: &[u8]) -> Result<EventId, IdError> {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest_bytes);
    EventId::parse(format!("${encoded}:{origin}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::id::{RoomId, UserId};

    struct FixedDigest;
    impl Digest for FixedDigest {
        fn digest(&self, bytes: &[u8]) -> Vec<u8> {
            bytes.iter().fold(0u8, |acc, b| acc ^ b).to_be_bytes().to_vec()
        }
        fn algorithm_name(&self) -> &'static str {
            "xor8"
        }
    }

    fn sample() -> Event {
        Event {
            event_id: None,
            room_id: RoomId::parse("!room:example.org").unwrap(),
            event_type: "m.room.create".to_string(),
            sender: UserId::parse("@alice:example.org").unwrap(),
            state_key: Some(String::new()),
            content: serde_json::json!({}),
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin: ServerName("example.org".to_string()),
            origin_server_ts: 1000,
            hashes: BTreeMap::new(),
            signatures: BTreeMap::new(),
            unsigned: None,
        }
    }

    #[test]
    fn make_id_forms_event_sigil() {
        let event = sample();
        let digest = FixedDigest;
        let hash = reference_hash(&event, &digest).unwrap();
        let id = make_id(&event.origin, &hash).unwrap();
        assert!(id.as_str().starts_with('$'));
        assert_eq!(id.domain(), "example.org");
    }

    #[test]
    fn reference_hash_is_deterministic() {
        let event = sample();
        let digest = FixedDigest;
        let a = reference_hash(&event, &digest).unwrap();
        let b = reference_hash(&event, &digest).unwrap();
        assert_eq!(a, b);
    }
}
