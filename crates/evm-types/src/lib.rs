#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **evm-types** – Shared primitive data structures for the Event Virtual
//! Machine.
//!
//! This crate owns the pieces every other EVM crate needs a shared
//! vocabulary for: the Matrix identifier grammar, the canonical [`Event`]
//! type and its digest-based identity operations, and the [`Fault`] bitmask
//! that every stage of the pipeline reports through. It has no knowledge of
//! storage, hooks, or the pipeline itself.

pub mod digest;
pub mod event;
pub mod fault;
pub mod id;

pub use digest::{make_id, reference_hash, Digest};
pub use event::Event;
pub use fault::{Fault, HttpStatus};
pub use id::{EventId, IdError, RoomAliasId, RoomId, ServerName, Sigil, UserId};

/// Re-exports the common set most downstream crates need.
pub mod prelude {
    pub use crate::digest::{make_id, reference_hash, Digest};
    pub use crate::event::Event;
    pub use crate::fault::{self, Fault, HttpStatus};
    pub use crate::id::{EventId, IdError, RoomAliasId, RoomId, ServerName, Sigil, UserId};
}
