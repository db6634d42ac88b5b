#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **evm-store-sled** – A durable, embedded [`TransactionStore`] over the
//! sled database engine.
//!
//! Every [`commit`](SledBackend::commit) first drives a companion
//! [`WriteAheadLog`] (spec §4.B ambient addition: "a write-ahead log
//! companion trait is carried from the teacher's storage layer as the
//! durability mechanism underneath `TransactionStore::commit`"), then
//! applies the event plus its room-head/room-state bookkeeping and
//! secondary index atomically into one sled tree via
//! [`sled::Tree::apply_batch`]. [`SledBackend::max_index`] recovers the
//! sequence dock's baseline at startup (spec §6 "Persisted state layout").

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use evm_store::{
    EventProjection, SequenceNumber, StoreError, TransactionStore, Txn, WalEntry, WalEntryState,
    WalOperation, WalRecoveryResult, WriteAheadLog, WriteOpts,
};
use evm_types::{Event, EventId, RoomId};
use sled::{Batch, Db, Tree};

const DATA_TREE: &str = "evm_data";
const WAL_TREE: &str = "evm_wal";
const KEY_MAX_INDEX: &[u8] = b"maxidx";

fn sled_err(err: sled::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn encode_err(err: rmp_serde::encode::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn decode_err(err: rmp_serde::decode::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn idx_key(index: SequenceNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + 8);
    key.extend_from_slice(b"idx:");
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn id_key(event_id: &EventId) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + event_id.as_str().len());
    key.extend_from_slice(b"id:");
    key.extend_from_slice(event_id.as_str().as_bytes());
    key
}

fn head_prefix(room_id: &RoomId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + room_id.as_str().len() + 1);
    key.extend_from_slice(b"head:");
    key.extend_from_slice(room_id.as_str().as_bytes());
    key.push(0);
    key
}

fn head_key(room_id: &RoomId, event_id: &EventId) -> Vec<u8> {
    let mut key = head_prefix(room_id);
    key.extend_from_slice(event_id.as_str().as_bytes());
    key
}

fn state_key(room_id: &RoomId, event_type: &str, key_part: &str) -> Vec<u8> {
    let mut key = Vec::new();
    key.extend_from_slice(b"state:");
    key.extend_from_slice(room_id.as_str().as_bytes());
    key.push(0);
    key.extend_from_slice(event_type.as_bytes());
    key.push(0);
    key.extend_from_slice(key_part.as_bytes());
    key
}

/// A durable, embedded [`TransactionStore`] backed by sled.
pub struct SledBackend {
    _db: Db,
    data: Tree,
    wal: Tree,
    wal_seq: AtomicU64,
}

impl SledBackend {
    /// Open or create a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(sled::Config::default().path(path))
    }

    /// Open with a caller-supplied sled configuration, e.g. for tuning
    /// cache size or compression.
    pub fn open_with_config(config: sled::Config) -> Result<Self, StoreError> {
        let db = config.open().map_err(sled_err)?;
        Self::from_db(db)
    }

    /// Wrap an already-open sled database, opening this crate's two trees
    /// within it.
    pub fn from_db(db: Db) -> Result<Self, StoreError> {
        let data = db.open_tree(DATA_TREE).map_err(sled_err)?;
        let wal = db.open_tree(WAL_TREE).map_err(sled_err)?;
        let wal_seq = wal
            .iter()
            .keys()
            .last()
            .transpose()
            .map_err(sled_err)?
            .and_then(|k| k.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        Ok(Self {
            _db: db,
            data,
            wal,
            wal_seq: AtomicU64::new(wal_seq),
        })
    }

    /// A temporary database for tests, removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(sled_err)?;
        Self::from_db(db)
    }

    /// Flush pending writes to disk, so committed events survive a crash
    /// from this point on.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.data.flush_async().await.map_err(sled_err)?;
        self.wal.flush_async().await.map_err(sled_err)?;
        Ok(())
    }

    /// Total number of durable events.
    pub fn event_count(&self) -> usize {
        self.data.scan_prefix(b"idx:").count()
    }

    fn next_wal_sequence(&self) -> u64 {
        self.wal_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn append_wal(&self, operation: WalOperation) -> Result<u64, StoreError> {
        let sequence = self.next_wal_sequence();
        let entry = WalEntry {
            wal_sequence: sequence,
            operation,
            timestamp: chrono::Utc::now(),
        };
        let bytes = rmp_serde::to_vec_named(&entry).map_err(encode_err)?;
        self.wal
            .insert(sequence.to_be_bytes(), bytes)
            .map_err(sled_err)?;
        Ok(sequence)
    }
}

#[async_trait]
impl TransactionStore for SledBackend {
    async fn exists(&self, event_id: &EventId) -> Result<bool, StoreError> {
        Ok(self.data.contains_key(id_key(event_id)).map_err(sled_err)?)
    }

    async fn index_of(&self, event_id: &EventId) -> Result<Option<SequenceNumber>, StoreError> {
        Ok(self
            .data
            .get(id_key(event_id))
            .map_err(sled_err)?
            .and_then(|v| v.as_ref().try_into().ok())
            .map(u64::from_be_bytes))
    }

    async fn get(&self, index: SequenceNumber) -> Result<Option<EventProjection>, StoreError> {
        match self.data.get(idx_key(index)).map_err(sled_err)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes).map_err(decode_err)?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, txn: Txn) -> Result<(), StoreError> {
        if txn.writes.is_empty() {
            return Err(StoreError::EmptyTransaction);
        }

        let lead_idx = txn.writes[0].opts.event_idx;
        self.append_wal(WalOperation::BeginTransaction { event_idx: lead_idx })
            .await?;

        let mut batch = Batch::default();
        let mut max_seen = self.max_index().await?;

        for staged in &txn.writes {
            let WriteOpts {
                present,
                history,
                room_head,
                room_refs,
                event_idx,
                ..
            } = staged.opts;
            let event = &staged.event;

            let event_bytes = rmp_serde::to_vec_named(event).map_err(encode_err)?;
            self.append_wal(WalOperation::CommitEvent {
                event_idx,
                bytes: event_bytes.clone(),
            })
            .await?;

            batch.insert(idx_key(event_idx), event_bytes);

            if let Some(id) = &event.event_id {
                batch.insert(id_key(id), event_idx.to_be_bytes().to_vec());
            }
            if room_refs {
                for prev in &event.prev_events {
                    batch.remove(head_key(&event.room_id, prev));
                }
            }
            if room_head {
                if let Some(id) = &event.event_id {
                    batch.insert(head_key(&event.room_id, id), &[][..]);
                }
            }
            if present || history {
                if let (Some(state_key_value), Some(id)) = (&event.state_key, &event.event_id) {
                    batch.insert(
                        state_key(&event.room_id, &event.event_type, state_key_value),
                        id.as_str().as_bytes(),
                    );
                }
            }
            max_seen = max_seen.max(event_idx);
        }

        batch.insert(KEY_MAX_INDEX, max_seen.to_be_bytes().to_vec());
        self.data.apply_batch(batch).map_err(sled_err)?;
        self.append_wal(WalOperation::CommitTransaction { event_idx: lead_idx })
            .await?;
        Ok(())
    }

    async fn room_head(&self, room_id: &RoomId) -> Result<Vec<EventId>, StoreError> {
        let prefix = head_prefix(room_id);
        let mut heads = Vec::new();
        for item in self.data.scan_prefix(&prefix) {
            let (key, _) = item.map_err(sled_err)?;
            let id_bytes = &key[prefix.len()..];
            let id_str = std::str::from_utf8(id_bytes)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            heads.push(EventId::parse(id_str).map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(heads)
    }

    async fn room_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key_value: &str,
    ) -> Result<Option<EventId>, StoreError> {
        match self
            .data
            .get(state_key(room_id, event_type, state_key_value))
            .map_err(sled_err)?
        {
            Some(bytes) => {
                let id_str = std::str::from_utf8(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(
                    EventId::parse(id_str).map_err(|e| StoreError::Backend(e.to_string()))?,
                ))
            }
            None => Ok(None),
        }
    }

    async fn max_index(&self) -> Result<SequenceNumber, StoreError> {
        Ok(self
            .data
            .get(KEY_MAX_INDEX)
            .map_err(sled_err)?
            .and_then(|v| v.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }
}

#[async_trait]
impl WriteAheadLog for SledBackend {
    async fn begin_transaction(&self, event_idx: SequenceNumber) -> Result<(), StoreError> {
        self.append_wal(WalOperation::BeginTransaction { event_idx }).await?;
        Ok(())
    }

    async fn write_entry(&self, event_idx: SequenceNumber, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.append_wal(WalOperation::CommitEvent { event_idx, bytes }).await?;
        Ok(())
    }

    async fn commit_transaction(&self, event_idx: SequenceNumber) -> Result<(), StoreError> {
        self.append_wal(WalOperation::CommitTransaction { event_idx }).await?;
        Ok(())
    }

    async fn rollback_transaction(&self, event_idx: SequenceNumber) -> Result<(), StoreError> {
        self.append_wal(WalOperation::RollbackTransaction { event_idx }).await?;
        Ok(())
    }

    async fn recover(&self) -> Result<WalRecoveryResult, StoreError> {
        use std::collections::BTreeMap;

        let mut states: BTreeMap<SequenceNumber, WalEntryState> = BTreeMap::new();
        for item in self.wal.iter() {
            let (_, bytes) = item.map_err(sled_err)?;
            let entry: WalEntry = rmp_serde::from_slice(&bytes).map_err(decode_err)?;
            match entry.operation {
                WalOperation::BeginTransaction { event_idx } => {
                    states.insert(event_idx, WalEntryState::Open);
                }
                WalOperation::CommitEvent { .. } => {}
                WalOperation::CommitTransaction { event_idx } => {
                    states.insert(event_idx, WalEntryState::Committed);
                }
                WalOperation::RollbackTransaction { event_idx } => {
                    states.insert(event_idx, WalEntryState::RolledBack);
                }
                WalOperation::Checkpoint { .. } => {}
            }
        }

        let mut result = WalRecoveryResult::default();
        for (event_idx, state) in states {
            match state {
                WalEntryState::Committed => result.committed.push(event_idx),
                WalEntryState::Open => result.incomplete.push(event_idx),
                WalEntryState::RolledBack => {}
            }
        }
        Ok(result)
    }

    async fn checkpoint(&self, up_to: SequenceNumber) -> Result<(), StoreError> {
        let mut to_remove = Vec::new();
        for item in self.wal.iter() {
            let (key, bytes) = item.map_err(sled_err)?;
            let entry: WalEntry = rmp_serde::from_slice(&bytes).map_err(decode_err)?;
            let event_idx = match entry.operation {
                WalOperation::BeginTransaction { event_idx }
                | WalOperation::CommitEvent { event_idx, .. }
                | WalOperation::CommitTransaction { event_idx }
                | WalOperation::RollbackTransaction { event_idx } => Some(event_idx),
                WalOperation::Checkpoint { .. } => None,
            };
            if event_idx.map(|idx| idx <= up_to).unwrap_or(false) {
                to_remove.push(key);
            }
        }
        for key in to_remove {
            self.wal.remove(key).map_err(sled_err)?;
        }
        self.append_wal(WalOperation::Checkpoint { up_to }).await?;
        Ok(())
    }

    async fn current_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.wal_seq.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evm_store::{Txn, WriteOpts};
    use evm_types::id::{ServerName, UserId};
    use std::collections::BTreeMap;

    fn make_event(room: &str, id: &str, event_type: &str, state_key_value: Option<&str>) -> Event {
        Event {
            event_id: Some(EventId::parse(id).unwrap()),
            room_id: RoomId::parse(room).unwrap(),
            event_type: event_type.to_string(),
            sender: UserId::parse("@alice:example.org").unwrap(),
            state_key: state_key_value.map(|s| s.to_string()),
            content: serde_json::json!({}),
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin: ServerName("example.org".to_string()),
            origin_server_ts: 1,
            hashes: BTreeMap::new(),
            signatures: BTreeMap::new(),
            unsigned: None,
        }
    }

    #[tokio::test]
    async fn commit_makes_event_durable_and_visible() {
        let backend = SledBackend::temporary().unwrap();
        let event = make_event("!r:example.org", "$a:example.org", "m.room.message", None);
        let event_id = event.event_id.clone().unwrap();
        let mut txn = Txn::with_reservation(64, 1);
        backend.stage_write(&mut txn, event, WriteOpts::message(1));
        backend.commit(txn).await.unwrap();

        assert!(backend.exists(&event_id).await.unwrap());
        assert_eq!(backend.index_of(&event_id).await.unwrap(), Some(1));
        assert_eq!(backend.get(1).await.unwrap().unwrap().event_id, Some(event_id));
        assert_eq!(backend.max_index().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn commit_rejects_empty_transaction() {
        let backend = SledBackend::temporary().unwrap();
        let txn = Txn::with_reservation(64, 1);
        assert!(matches!(backend.commit(txn).await, Err(StoreError::EmptyTransaction)));
    }

    #[tokio::test]
    async fn room_head_and_room_state_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evm.db");
        let room = "!r:example.org";

        {
            let backend = SledBackend::open(&path).unwrap();
            let event = make_event(room, "$a:example.org", "m.room.create", Some(""));
            let mut txn = Txn::with_reservation(64, 1);
            backend.stage_write(&mut txn, event, WriteOpts::state(1));
            backend.commit(txn).await.unwrap();
            backend.flush().await.unwrap();
        }

        {
            let backend = SledBackend::open(&path).unwrap();
            let heads = backend.room_head(&RoomId::parse(room).unwrap()).await.unwrap();
            assert_eq!(heads, vec![EventId::parse("$a:example.org").unwrap()]);
            let state = backend
                .room_state(&RoomId::parse(room).unwrap(), "m.room.create", "")
                .await
                .unwrap();
            assert_eq!(state, Some(EventId::parse("$a:example.org").unwrap()));
            assert_eq!(backend.max_index().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn recover_reports_committed_transactions() {
        let backend = SledBackend::temporary().unwrap();
        let event = make_event("!r:example.org", "$a:example.org", "m.room.message", None);
        let mut txn = Txn::with_reservation(64, 1);
        backend.stage_write(&mut txn, event, WriteOpts::message(1));
        backend.commit(txn).await.unwrap();

        let recovery = backend.recover().await.unwrap();
        assert_eq!(recovery.committed, vec![1]);
        assert!(recovery.incomplete.is_empty());
    }
}
