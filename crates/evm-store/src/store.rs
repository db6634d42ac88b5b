//! The append-only event log abstraction the EVM pipeline writes through
//! (spec §4.B).

use async_trait::async_trait;
use evm_types::{Event, EventId, RoomId};

use crate::model::{EventProjection, SequenceNumber, Txn, WriteOpts};

/// Errors raised by a [`TransactionStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying backend failed (I/O, serialization, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
    /// `commit` was called with a transaction that staged no writes.
    #[error("transaction has no staged writes")]
    EmptyTransaction,
    /// A write referenced a room with no recorded head, and the caller
    /// required one (spec §4.F.6.c: fault STATE).
    #[error("room {0} has no recorded head")]
    MissingRoomHead(RoomId),
}

/// The append-only event log, indexed both by its durable sequence number
/// (the primary key) and by event id (a secondary index).
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Whether an event with this id has already been written.
    async fn exists(&self, event_id: &EventId) -> Result<bool, StoreError>;

    /// The durable index of a written event, if any.
    async fn index_of(&self, event_id: &EventId) -> Result<Option<SequenceNumber>, StoreError>;

    /// Fetch the event written at `index`.
    async fn get(&self, index: SequenceNumber) -> Result<Option<EventProjection>, StoreError>;

    /// Open a transaction sized by the given reservation hints; no I/O
    /// occurs until [`commit`](Self::commit).
    async fn open_txn(&self, reserved_bytes: usize, reserved_index: usize) -> Txn {
        Txn::with_reservation(reserved_bytes, reserved_index)
    }

    /// Stage `event` into `txn` under `opts`. Pure in-memory bookkeeping;
    /// durability happens at `commit`.
    fn stage_write(&self, txn: &mut Txn, event: Event, opts: WriteOpts) {
        txn.push(event, opts);
    }

    /// Apply every write staged in `txn` atomically: either all become
    /// durable or none do. Linearizable with respect to any subsequent
    /// `exists`/`get` observed from any thread (spec §4.B).
    async fn commit(&self, txn: Txn) -> Result<(), StoreError>;

    /// The current head set for `room_id`: event ids not referenced by any
    /// other event's `prev_events`. Used by the commit composer (spec
    /// §4.G) and by the write stage's head-required check (spec §4.F.6.c).
    async fn room_head(&self, room_id: &RoomId) -> Result<Vec<EventId>, StoreError>;

    /// The current state event id for `(room_id, event_type, state_key)`,
    /// if any. Used by the commit composer to select auth events.
    async fn room_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<EventId>, StoreError>;

    /// The largest durable sequence index recorded, or `0` for a fresh
    /// store. A durable backend overrides this to recover the sequence
    /// dock's baseline after a restart (spec §6 "Persisted state layout");
    /// the in-memory backend's default of `0` is correct since it never
    /// survives a restart.
    async fn max_index(&self) -> Result<SequenceNumber, StoreError> {
        Ok(0)
    }
}
