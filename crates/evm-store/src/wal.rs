//! A write-ahead log companion trait, the durability mechanism underneath
//! [`TransactionStore::commit`](crate::TransactionStore::commit). Concrete
//! backends drive one WAL transaction per `commit()` call so the
//! linearizable-commit guarantee (spec §4.B) survives a process restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::SequenceNumber;

/// A single WAL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonic WAL sequence, independent of the event log's own sequence
    /// numbers (a single commit may write several WAL entries).
    pub wal_sequence: u64,
    /// The operation this entry records.
    pub operation: WalOperation,
    /// When this entry was appended.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The kind of mutation a [`WalEntry`] records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOperation {
    /// Opens a transaction identified by `event_idx`.
    BeginTransaction {
        /// The sequence number the transaction will commit under.
        event_idx: SequenceNumber,
    },
    /// Records one staged event write within an open transaction, as
    /// serialized bytes (the backend's own `Event` encoding).
    CommitEvent {
        /// The transaction this write belongs to.
        event_idx: SequenceNumber,
        /// Serialized event bytes.
        bytes: Vec<u8>,
    },
    /// Marks a transaction as durably committed.
    CommitTransaction {
        /// The committed transaction's sequence number.
        event_idx: SequenceNumber,
    },
    /// Marks a transaction as rolled back (never became durable).
    RollbackTransaction {
        /// The rolled-back transaction's sequence number.
        event_idx: SequenceNumber,
    },
    /// A checkpoint marker; entries before it may be compacted away.
    Checkpoint {
        /// The last sequence number folded into the checkpoint.
        up_to: SequenceNumber,
    },
}

/// The recovery state of a transaction found in the log at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalEntryState {
    /// Begun but no terminal record was found.
    Open,
    /// Committed durably.
    Committed,
    /// Rolled back.
    RolledBack,
}

/// The outcome of replaying the log at startup.
#[derive(Debug, Clone, Default)]
pub struct WalRecoveryResult {
    /// Sequence numbers found committed.
    pub committed: Vec<SequenceNumber>,
    /// Sequence numbers found open with no terminal record (crashed
    /// mid-commit; the backend must treat these as never-happened).
    pub incomplete: Vec<SequenceNumber>,
}

/// A write-ahead log. Implementations back a [`crate::TransactionStore`]'s
/// durability; the core never talks to this trait directly.
#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Append a `BeginTransaction` record.
    async fn begin_transaction(&self, event_idx: SequenceNumber) -> Result<(), crate::StoreError>;

    /// Append a `CommitEvent` record for one staged write.
    async fn write_entry(
        &self,
        event_idx: SequenceNumber,
        bytes: Vec<u8>,
    ) -> Result<(), crate::StoreError>;

    /// Append a `CommitTransaction` record, making the transaction durable.
    async fn commit_transaction(&self, event_idx: SequenceNumber) -> Result<(), crate::StoreError>;

    /// Append a `RollbackTransaction` record.
    async fn rollback_transaction(&self, event_idx: SequenceNumber) -> Result<(), crate::StoreError>;

    /// Replay the log, reporting which transactions committed and which
    /// were left open by a crash.
    async fn recover(&self) -> Result<WalRecoveryResult, crate::StoreError>;

    /// Compact entries at or before `up_to` into a checkpoint.
    async fn checkpoint(&self, up_to: SequenceNumber) -> Result<(), crate::StoreError>;

    /// The highest WAL sequence appended so far.
    async fn current_sequence(&self) -> Result<u64, crate::StoreError>;
}
