//! The canonical `Event` type and its identity operations (spec §3, §4.A).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{EventId, RoomId, ServerName, UserId};

/// A Matrix event.
///
/// `event_id` is absent for ephemeral events (EDUs): they pass through the
/// same dispatch as durable events but are never written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Absent until computed by the commit composer or assigned by the
    /// issuing server; always present on a durable, already-logged event.
    #[serde(rename = "event_id", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,

    /// The room this event belongs to.
    pub room_id: RoomId,

    /// The event type, e.g. `m.room.message`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The sending user.
    pub sender: UserId,

    /// Present for state events; identifies the (type, state_key) slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Event-type-specific payload.
    pub content: serde_json::Value,

    /// Ordered references to the room-head events this event builds on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev_events: Vec<EventId>,

    /// Unordered references to the auth events authorizing this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_events: Vec<EventId>,

    /// Room-monotone depth; `max(prev.depth) + 1`, saturating.
    pub depth: i64,

    /// The server that originated this event.
    pub origin: ServerName,

    /// Origination timestamp in milliseconds since the epoch.
    pub origin_server_ts: i64,

    /// Digest algorithm name to digest value over the canonical event.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,

    /// Server name to (algorithm:key-id to signature) map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,

    /// Server-local metadata not covered by the reference hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<serde_json::Value>,
}

impl Event {
    /// Whether this event is ephemeral (an EDU): it carries no `event_id`
    /// and bypasses sequence allocation and the log entirely (spec
    /// invariant 5).
    pub fn is_ephemeral(&self) -> bool {
        self.event_id.is_none()
    }

    /// A human-readable rendering suitable for a single log line, mirroring
    /// the original homeserver's `pretty_oneline` formatter.
    pub fn pretty_oneline(&self) -> String {
        format!(
            "{} {} {} by {} depth={} @{}",
            self.event_id
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_else(|| "<ephemeral>".to_string()),
            self.room_id,
            self.event_type,
            self.sender,
            self.depth,
            self.origin,
        )
    }

    /// Deterministic serialization used as digest input: the `signatures`,
    /// `hashes`, and `unsigned` fields are removed, and `content` is
    /// re-serialized through a `BTreeMap` pass so member order is a
    /// function of key name alone, independent of insertion order.
    ///
    /// Returns the canonical bytes as a compact JSON document; callers that
    /// need the reference hash use [`reference_hash`] instead of hashing
    /// these bytes directly against an arbitrary digest, since the digest
    /// algorithm is pluggable at the `evm-auth` layer.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            event_id: &'a Option<EventId>,
            room_id: &'a RoomId,
            #[serde(rename = "type")]
            event_type: &'a str,
            sender: &'a UserId,
            #[serde(skip_serializing_if = "Option::is_none")]
            state_key: &'a Option<String>,
            content: serde_json::Value,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            prev_events: &'a Vec<EventId>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            auth_events: &'a Vec<EventId>,
            depth: i64,
            origin: &'a ServerName,
            origin_server_ts: i64,
        }

        let canonical = Canonical {
            event_id: &self.event_id,
            room_id: &self.room_id,
            event_type: &self.event_type,
            sender: &self.sender,
            state_key: &self.state_key,
            content: canonicalize_value(&self.content),
            prev_events: &self.prev_events,
            auth_events: &self.auth_events,
            depth: self.depth,
            origin: &self.origin,
            origin_server_ts: self.origin_server_ts,
        };
        serde_json::to_vec(&canonical)
    }
}

/// Re-serialize a JSON value through `BTreeMap` so object members are
/// ordered by key name rather than by insertion order, giving a stable byte
/// representation regardless of how the value was originally constructed.
fn canonicalize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_value(v)))
                .collect();
            serde_json::to_value(sorted).expect("BTreeMap<String, Value> always serializes")
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize_value).collect())
        }
        other => other.clone(),
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_oneline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(depth: i64) -> Event {
        Event {
            event_id: None,
            room_id: RoomId::parse("!room:example.org").unwrap(),
            event_type: "m.room.message".to_string(),
            sender: UserId::parse("@alice:example.org").unwrap(),
            state_key: None,
            content: serde_json::json!({"b": 1, "a": 2}),
            prev_events: vec![],
            auth_events: vec![],
            depth,
            origin: ServerName("example.org".to_string()),
            origin_server_ts: 1000,
            hashes: BTreeMap::new(),
            signatures: BTreeMap::new(),
            unsigned: None,
        }
    }

    #[test]
    fn ephemeral_detection() {
        assert!(sample(1).is_ephemeral());
        let mut e = sample(1);
        e.event_id = Some(EventId::parse("$abc:example.org").unwrap());
        assert!(!e.is_ephemeral());
    }

    #[test]
    fn canonical_bytes_are_order_independent() {
        let mut a = sample(1);
        a.content = serde_json::json!({"b": 1, "a": 2});
        let mut b = sample(1);
        b.content = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn canonical_bytes_excludes_signatures_and_hashes() {
        let mut with_sig = sample(1);
        with_sig
            .signatures
            .entry("example.org".to_string())
            .or_default()
            .insert("ed25519:1".to_string(), "sig".to_string());
        with_sig
            .hashes
            .insert("sha256".to_string(), "digest".to_string());
        let without_sig = sample(1);
        assert_eq!(
            with_sig.canonical_bytes().unwrap(),
            without_sig.canonical_bytes().unwrap()
        );
    }

    #[test]
    fn pretty_oneline_marks_ephemeral() {
        let line = sample(1).pretty_oneline();
        assert!(line.contains("<ephemeral>"));
    }
}
