#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **evm-store** – The append-only event log abstraction for the Event
//! Virtual Machine.
//!
//! This crate defines [`TransactionStore`], the trait the write stage of the
//! pipeline drives (spec §4.B/§4.F.6), the [`WriteOpts`]/[`Txn`] types it
//! stages mutations through, and the [`WriteAheadLog`] durability layer a
//! concrete backend sits on top of. Concrete backends (`evm-store-memory`,
//! `evm-store-sled`) implement `TransactionStore` in separate crates.

pub mod model;
pub mod store;
pub mod wal;

pub use model::{
    reserve_bytes_for, EventProjection, EventRef, SequenceNumber, StagedWrite, StateRoot, Txn,
    WriteOpts, RESERVE_BYTES_MULTIPLIER,
};
pub use store::{StoreError, TransactionStore};
pub use wal::{WalEntry, WalEntryState, WalOperation, WalRecoveryResult, WriteAheadLog};

/// Re-exports the common set most downstream crates need.
pub mod prelude {
    pub use crate::model::{
        reserve_bytes_for, EventProjection, EventRef, SequenceNumber, StagedWrite, StateRoot, Txn,
        WriteOpts,
    };
    pub use crate::store::{StoreError, TransactionStore};
    pub use crate::wal::{WalEntry, WalEntryState, WalOperation, WalRecoveryResult, WriteAheadLog};
}
