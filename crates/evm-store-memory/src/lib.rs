#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **evm-store-memory** – Non-persistent in-memory `TransactionStore`.
//!
//! Backs the demo CLI and the test suites of `evm-core`/`evm-runtime`. All
//! state lives in process memory and is lost on drop; there is no WAL.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use evm_store::{EventProjection, SequenceNumber, StoreError, TransactionStore, Txn, WriteOpts};
use evm_types::{Event, EventId, RoomId};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    by_index: HashMap<SequenceNumber, Event>,
    index_of: HashMap<EventId, SequenceNumber>,
    room_heads: HashMap<RoomId, HashSet<EventId>>,
    room_state: HashMap<(RoomId, String, String), EventId>,
}

/// An in-memory, non-durable `TransactionStore`.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events currently written.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.by_index.len()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn exists(&self, event_id: &EventId) -> Result<bool, StoreError> {
        Ok(self.state.read().await.index_of.contains_key(event_id))
    }

    async fn index_of(&self, event_id: &EventId) -> Result<Option<SequenceNumber>, StoreError> {
        Ok(self.state.read().await.index_of.get(event_id).copied())
    }

    async fn get(&self, index: SequenceNumber) -> Result<Option<EventProjection>, StoreError> {
        Ok(self.state.read().await.by_index.get(&index).cloned())
    }

    async fn commit(&self, txn: Txn) -> Result<(), StoreError> {
        if txn.writes.is_empty() {
            return Err(StoreError::EmptyTransaction);
        }
        let mut state = self.state.write().await;
        for staged in txn.writes {
            let WriteOpts {
                present,
                history,
                room_head,
                room_refs,
                event_idx,
                ..
            } = staged.opts;
            let event = staged.event;

            if room_refs {
                let heads = state.room_heads.entry(event.room_id.clone()).or_default();
                for prev in &event.prev_events {
                    heads.remove(prev);
                }
            }
            if room_head {
                if let Some(id) = &event.event_id {
                    state
                        .room_heads
                        .entry(event.room_id.clone())
                        .or_default()
                        .insert(id.clone());
                }
            }
            if present || history {
                if let (Some(state_key), Some(id)) = (&event.state_key, &event.event_id) {
                    state.room_state.insert(
                        (event.room_id.clone(), event.event_type.clone(), state_key.clone()),
                        id.clone(),
                    );
                }
            }

            if let Some(id) = event.event_id.clone() {
                state.index_of.insert(id, event_idx);
            }
            state.by_index.insert(event_idx, event);
        }
        Ok(())
    }

    async fn room_head(&self, room_id: &RoomId) -> Result<Vec<EventId>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .room_heads
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn room_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<EventId>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .room_state
            .get(&(room_id.clone(), event_type.to_string(), state_key.to_string()))
            .cloned())
    }
}
