//! Write options and the staged-transaction handle (spec §4.B).

use evm_types::{Event, EventId, RoomId};

/// The durable, monotonically assigned primary key of the event log. Zero
/// is never a valid assigned index; it is reserved for "unassigned".
pub type SequenceNumber = u64;

/// A root digest for the room state tree, opaque to the EVM core; room
/// state resolution is an external collaborator (spec §1).
pub type StateRoot = Vec<u8>;

/// Options controlling how [`stage_write`](crate::TransactionStore::stage_write)
/// mutates room bookkeeping alongside the event itself.
#[derive(Debug, Clone, Default)]
pub struct WriteOpts {
    /// Update the room's `(type, state_key) → event_id` state map.
    pub present: bool,
    /// Update the state tree (history) rather than only the present map.
    pub history: bool,
    /// Add this event to the room's head set.
    pub room_head: bool,
    /// Remove this event's `prev_events` from the room's head set.
    pub room_refs: bool,
    /// Trust the caller's serialized bytes rather than re-serializing.
    pub json_source: bool,
    /// The sequence number this event is being written under.
    pub event_idx: SequenceNumber,
    /// The state tree root before this write.
    pub root_in: Option<StateRoot>,
    /// The state tree root after this write.
    pub root_out: Option<StateRoot>,
}

impl WriteOpts {
    /// Options for a plain message event: update head bookkeeping only.
    pub fn message(event_idx: SequenceNumber) -> Self {
        Self {
            room_head: true,
            room_refs: true,
            event_idx,
            ..Default::default()
        }
    }

    /// Options for a state event: also update the present/history maps.
    pub fn state(event_idx: SequenceNumber) -> Self {
        Self {
            present: true,
            history: true,
            room_head: true,
            room_refs: true,
            event_idx,
            ..Default::default()
        }
    }
}

/// A single staged mutation inside an open transaction. `stage_write` may be
/// called more than once per transaction (e.g. the event write plus any
/// room-head adjustments); `commit` applies every staged write atomically.
#[derive(Debug, Clone)]
pub struct StagedWrite {
    /// The event being written.
    pub event: Event,
    /// The options under which it was staged.
    pub opts: WriteOpts,
}

/// A transaction staged against the log but not yet durable. Obtained from
/// [`TransactionStore::open_txn`](crate::TransactionStore::open_txn) and
/// consumed by [`TransactionStore::commit`](crate::TransactionStore::commit).
#[derive(Debug, Default)]
pub struct Txn {
    /// The room this transaction writes into, if any (commits unrelated to
    /// a single room, e.g. m.room.create, still set this after the first
    /// staged write).
    pub room_id: Option<RoomId>,
    /// Mutations staged so far, in staging order.
    pub writes: Vec<StagedWrite>,
    reserved_bytes: usize,
    reserved_index: usize,
}

impl Txn {
    /// Open an empty transaction sized to the given reservation hints. The
    /// reservation is advisory (matches the spec's `reserve_bytes +
    /// reserve_index` sizing note); backends are free to ignore it.
    pub fn with_reservation(reserved_bytes: usize, reserved_index: usize) -> Self {
        Self {
            room_id: None,
            writes: Vec::with_capacity(reserved_index.max(1)),
            reserved_bytes,
            reserved_index,
        }
    }

    /// The byte reservation this transaction was opened with.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// The index-count reservation this transaction was opened with.
    pub fn reserved_index(&self) -> usize {
        self.reserved_index
    }

    /// Stage a write into this transaction.
    pub fn push(&mut self, event: Event, opts: WriteOpts) {
        if self.room_id.is_none() {
            self.room_id = Some(event.room_id.clone());
        }
        self.writes.push(StagedWrite { event, opts });
    }
}

/// The default byte-reservation multiplier applied to `canonical_bytes.len`
/// when opening a transaction for a single event (spec §4.F.6.a:
/// `reserve_bytes ≈ 1.66 × canonical_bytes.len`).
pub const RESERVE_BYTES_MULTIPLIER: f64 = 1.66;

/// Compute the byte reservation for a transaction holding one event whose
/// canonical bytes are `canonical_len` long.
pub fn reserve_bytes_for(canonical_len: usize) -> usize {
    ((canonical_len as f64) * RESERVE_BYTES_MULTIPLIER).ceil() as usize
}

/// A projection of event fields returned by `get`, mirroring spec §4.B's
/// `get(index, keys) → event-projection`. This crate always returns the
/// full [`Event`]; callers that want a narrower projection filter it
/// themselves since Rust's ownership model makes an unprojected clone
/// cheaper than a bespoke partial-field protocol.
pub type EventProjection = Event;

/// A reference to an event by either its durable index or its id, used by
/// callers that may have either at hand.
#[derive(Debug, Clone)]
pub enum EventRef {
    /// By durable sequence index.
    Index(SequenceNumber),
    /// By event id.
    Id(EventId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_bytes_applies_multiplier() {
        assert_eq!(reserve_bytes_for(100), 166);
    }

    #[test]
    fn txn_tracks_room_id_from_first_write() {
        let txn = Txn::with_reservation(256, 1);
        assert!(txn.room_id.is_none());
        assert_eq!(txn.reserved_bytes(), 256);
    }

    #[test]
    fn message_opts_touch_head_not_present() {
        let opts = WriteOpts::message(5);
        assert!(opts.room_head);
        assert!(!opts.present);
        assert_eq!(opts.event_idx, 5);
    }

    #[test]
    fn state_opts_touch_present_and_history() {
        let opts = WriteOpts::state(7);
        assert!(opts.present);
        assert!(opts.history);
    }
}
