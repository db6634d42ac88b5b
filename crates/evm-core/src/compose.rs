//! The commit composer (spec §4.G): builds a complete [`Event`] for local
//! issuance from a partially filled builder, an optional room context, and
//! the [`Copts`] injection flags.

use evm_types::digest::Digest;
use evm_types::id::{EventId, RoomId, ServerName, UserId};
use evm_types::{fault, Event, Fault};
use evm_auth::Signer;
use evm_store::TransactionStore;

use crate::error::{store_fault, VmError};
use crate::opts::Copts;

/// Up to this many room-head events become `prev_events` on a newly
/// composed event (spec §4.G step 2, §8 boundary behavior).
pub const PREV_LIMIT: usize = 16;

/// The state event types consulted for `auth_events` on a non-create event
/// (spec §4.G step 3), beyond the sender's own member event.
const AUTH_STATE_TYPES: [&str; 3] = [
    "m.room.create",
    "m.room.join_rules",
    "m.room.power_levels",
];

/// An in-progress event under construction, recording insertion order the
/// way the original's `json::iov` did (spec §9 "Initializer-list
/// composition"). Canonical bytes are re-sorted at serialization time
/// regardless (`Event::canonical_bytes`), so insertion order here is for
/// parity with the source's builder shape, not functional correctness.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    /// Left unset when `room` is supplied to [`compose`]; the room context
    /// fills it in (spec §4.G step 1).
    pub room_id: Option<RoomId>,
    /// The event type, e.g. `"m.room.message"`.
    pub event_type: String,
    /// The sending user.
    pub sender: UserId,
    /// Present for state events.
    pub state_key: Option<String>,
    /// The event's payload.
    pub content: serde_json::Value,
}

impl EventBuilder {
    /// Start building an event of `event_type` sent by `sender`.
    pub fn new(event_type: impl Into<String>, sender: UserId) -> Self {
        Self {
            room_id: None,
            event_type: event_type.into(),
            sender,
            state_key: None,
            content: serde_json::json!({}),
        }
    }

    /// Attach a room context directly, bypassing [`RoomContext`].
    pub fn with_room_id(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    /// Mark this a state event under `state_key`.
    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    /// Set the event's content.
    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }
}

/// The room a commit is being composed into, used to compute `prev_events`,
/// `depth`, and `auth_events` (spec §4.G steps 2–3).
pub struct RoomContext<'a> {
    /// The room this event is being composed into.
    pub room_id: RoomId,
    /// The store `prev_events`/`auth_events` are resolved against.
    pub store: &'a dyn TransactionStore,
}

/// Compose a complete [`Event`] from `builder`, applying `copts`'s
/// injection flags and, for non-create events, the room context's head and
/// state bookkeeping (spec §4.G). `signer` is required only if
/// `copts.add_sig` is set.
pub async fn compose(
    mut builder: EventBuilder,
    copts: &Copts,
    room: Option<&RoomContext<'_>>,
    signer: Option<&dyn Signer>,
    digest: &dyn Digest,
) -> Result<Event, VmError> {
    if let Some(room) = room {
        builder.room_id = Some(room.room_id.clone());
    }
    let room_id = builder
        .room_id
        .clone()
        .ok_or_else(|| VmError::new(Fault::from_bits(fault::INVALID), "no room_id for composed event"))?;

    let is_create = builder.event_type == "m.room.create";
    let mut prev_events = Vec::new();
    let mut auth_events = Vec::new();
    let mut depth: i64 = 0;

    if !is_create {
        let room = room.ok_or_else(|| {
            VmError::new(
                Fault::from_bits(fault::STATE),
                "no room context for non-create event",
            )
        })?;

        let head_ids = room.store.room_head(&room_id).await.map_err(store_fault)?;
        if head_ids.is_empty() {
            return Err(VmError::new(
                Fault::from_bits(fault::STATE),
                format!("room {room_id} has no head"),
            ));
        }

        let mut head_events = Vec::with_capacity(head_ids.len());
        for id in &head_ids {
            if let Some(idx) = room.store.index_of(id).await.map_err(store_fault)? {
                if let Some(event) = room.store.get(idx).await.map_err(store_fault)? {
                    head_events.push(event);
                }
            }
        }
        // Topmost (deepest) first, so truncating to PREV_LIMIT keeps the
        // deepest events even when the head set is larger (spec §8).
        head_events.sort_by(|a, b| b.depth.cmp(&a.depth));
        head_events.truncate(PREV_LIMIT);

        depth = head_events
            .iter()
            .map(|e| e.depth)
            .max()
            .unwrap_or(0)
            .saturating_add(1);

        if copts.add_prev_events {
            prev_events = head_events
                .iter()
                .filter_map(|e| e.event_id.clone())
                .collect();
        }

        if copts.add_auth_events {
            for (event_type, state_key) in AUTH_STATE_TYPES.iter().map(|t| (*t, "")) {
                if let Some(id) = room
                    .store
                    .room_state(&room_id, event_type, state_key)
                    .await
                    .map_err(store_fault)?
                {
                    auth_events.push(id);
                }
            }
            if builder.event_type != "m.room.member" {
                if let Some(id) = room
                    .store
                    .room_state(&room_id, "m.room.member", builder.sender.as_str())
                    .await
                    .map_err(store_fault)?
                {
                    auth_events.push(id);
                }
            }
        }
    }

    let origin = signer
        .map(|s| s.server_name().clone())
        .unwrap_or_else(|| ServerName(room_id.domain().to_string()));

    let mut event = Event {
        event_id: None,
        room_id,
        event_type: builder.event_type,
        sender: builder.sender,
        state_key: builder.state_key,
        content: builder.content,
        prev_events,
        auth_events,
        depth,
        origin: if copts.add_origin {
            origin.clone()
        } else {
            ServerName(String::new())
        },
        origin_server_ts: if copts.add_origin_server_ts {
            chrono::Utc::now().timestamp_millis()
        } else {
            0
        },
        hashes: Default::default(),
        signatures: Default::default(),
        unsigned: None,
    };

    if copts.add_event_id {
        let hash = evm_types::digest::reference_hash(&event, digest).map_err(crate::error::invalid_fault)?;
        let id = make_event_id(&event.origin, &hash)?;
        event.event_id = Some(id);
    }

    if copts.add_hash {
        let hash = evm_types::digest::reference_hash(&event, digest).map_err(crate::error::invalid_fault)?;
        event
            .hashes
            .insert(digest.algorithm_name().to_string(), base64_encode(&hash));
    }

    if copts.add_sig {
        if let Some(signer) = signer {
            let bytes = event.canonical_bytes().map_err(crate::error::invalid_fault)?;
            let signature = signer.sign(&bytes);
            event
                .signatures
                .entry(signer.server_name().0.clone())
                .or_default()
                .insert(signer.key_id().to_string(), signature);
        }
    }

    Ok(event)
}

fn make_event_id(origin: &ServerName, digest_bytes: &[u8]) -> Result<EventId, VmError> {
    evm_types::digest::make_id(origin, digest_bytes)
        .map_err(|e| VmError::new(Fault::from_bits(fault::INVALID), e.to_string()))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evm_auth::Sha256Digest;
    use evm_store_memory::MemoryStore;
    use evm_store::{TransactionStore, WriteOpts};

    fn alice() -> UserId {
        UserId::parse("@alice:example.org").unwrap()
    }

    #[tokio::test]
    async fn create_event_needs_no_room_context() {
        let builder = EventBuilder::new("m.room.create", alice())
            .with_room_id(RoomId::parse("!r:example.org").unwrap())
            .with_state_key("")
            .with_content(serde_json::json!({"creator": "@alice:example.org"}));
        let copts = Copts::default();
        let digest = Sha256Digest;
        let event = compose(builder, &copts, None, None, &digest).await.unwrap();
        assert_eq!(event.depth, 0);
        assert!(event.prev_events.is_empty());
        assert!(event.event_id.is_some());
    }

    #[tokio::test]
    async fn non_create_without_room_context_faults_state() {
        let builder = EventBuilder::new("m.room.message", alice());
        let copts = Copts::default();
        let digest = Sha256Digest;
        let err = compose(builder, &copts, None, None, &digest).await.unwrap_err();
        assert!(err.fault.has(fault::STATE));
    }

    #[tokio::test]
    async fn non_create_with_empty_head_faults_state() {
        let store = MemoryStore::new();
        let room_id = RoomId::parse("!r:example.org").unwrap();
        let builder = EventBuilder::new("m.room.message", alice()).with_room_id(room_id.clone());
        let copts = Copts::default();
        let digest = Sha256Digest;
        let room = RoomContext { room_id, store: &store };
        let err = compose(builder, &copts, Some(&room), None, &digest).await.unwrap_err();
        assert!(err.fault.has(fault::STATE));
    }

    #[tokio::test]
    async fn message_after_create_computes_prev_and_depth() {
        let store = MemoryStore::new();
        let room_id = RoomId::parse("!r:example.org").unwrap();
        let digest = Sha256Digest;
        let copts = Copts::default();

        let create = EventBuilder::new("m.room.create", alice())
            .with_room_id(room_id.clone())
            .with_state_key("")
            .with_content(serde_json::json!({"creator": "@alice:example.org"}));
        let create_event = compose(create, &copts, None, None, &digest).await.unwrap();
        let create_id = create_event.event_id.clone().unwrap();

        let mut txn = store.open_txn(64, 1).await;
        store.stage_write(&mut txn, create_event, WriteOpts::state(1));
        store.commit(txn).await.unwrap();

        let msg = EventBuilder::new("m.room.message", alice())
            .with_content(serde_json::json!({"msgtype": "m.text", "body": "hi"}));
        let room = RoomContext { room_id, store: &store };
        let msg_event = compose(msg, &copts, Some(&room), None, &digest).await.unwrap();

        assert_eq!(msg_event.prev_events, vec![create_id]);
        assert_eq!(msg_event.depth, 1);
    }
}
