//! The EVM fault taxonomy (spec §4.H).
//!
//! A [`Fault`] is a bitmask rather than a single discriminant: a stage may
//! accumulate more than one concern about an event (for instance `INVALID`
//! and `STATE` together), and callers test membership with [`Fault::has`]
//! rather than matching a single variant.

use std::fmt;

/// A single fault bit, named after the condition it flags.
pub type Bits = u32;

/// The event was accepted; no fault occurred.
pub const ACCEPT: Bits = 0x00;
/// The event already exists in the log.
pub const EXISTS: Bits = 0x01;
/// An unspecified internal failure.
pub const GENERAL: Bits = 0x02;
/// The event failed structural or grammar validation.
pub const INVALID: Bits = 0x04;
/// The event failed an authorization rule.
pub const AUTH: Bits = 0x08;
/// The event conflicts with resolved room state.
pub const STATE: Bits = 0x10;
/// The event itself is malformed independent of room state.
pub const EVENT: Bits = 0x20;
/// Evaluation was interrupted before completing.
pub const INTERRUPT: Bits = 0x40;

/// A bitmask of [`Fault`] conditions raised while evaluating an event.
///
/// `Fault::accept()` (the zero value) means the event was fully accepted.
/// Any other value names one or more conditions that prevented acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Fault(Bits);

impl Fault {
    /// The accepted, no-fault value.
    pub const fn accept() -> Self {
        Fault(ACCEPT)
    }

    /// Construct a fault from raw bits.
    pub const fn from_bits(bits: Bits) -> Self {
        Fault(bits)
    }

    /// The raw bitmask.
    pub const fn bits(self) -> Bits {
        self.0
    }

    /// Whether this fault carries no bits set (the event was accepted).
    pub const fn is_accept(self) -> bool {
        self.0 == ACCEPT
    }

    /// Whether `bit` is set in this fault.
    pub const fn has(self, bit: Bits) -> bool {
        self.0 & bit != 0
    }

    /// Merge another fault's bits into this one.
    pub fn insert(&mut self, bit: Bits) {
        self.0 |= bit;
    }

    /// A short uppercase name for the dominant (highest-priority) bit set,
    /// matching the original's `reflect()` log rendering. Priority is
    /// INTERRUPT > AUTH > STATE > EVENT > INVALID > EXISTS > GENERAL.
    pub fn reflect(self) -> &'static str {
        if self.has(INTERRUPT) {
            "INTERRUPT"
        } else if self.has(AUTH) {
            "AUTH"
        } else if self.has(STATE) {
            "STATE"
        } else if self.has(EVENT) {
            "EVENT"
        } else if self.has(INVALID) {
            "INVALID"
        } else if self.has(EXISTS) {
            "EXISTS"
        } else if self.has(GENERAL) {
            "GENERAL"
        } else {
            "ACCEPT"
        }
    }

    /// The HTTP-status-shaped outcome an external transport would report for
    /// this fault (spec §7). This crate does not depend on an HTTP crate;
    /// callers map [`HttpStatus`] onto whatever status type their transport
    /// uses.
    pub fn http_status(self) -> HttpStatus {
        if self.is_accept() {
            HttpStatus::Ok
        } else if self.has(INTERRUPT) {
            HttpStatus::ServiceUnavailable
        } else if self.has(EXISTS) {
            HttpStatus::Conflict
        } else if self.has(AUTH) {
            HttpStatus::Forbidden
        } else if self.has(STATE) || self.has(EVENT) {
            HttpStatus::NotFound
        } else if self.has(INVALID) {
            HttpStatus::BadRequest
        } else {
            HttpStatus::InternalServerError
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reflect())
    }
}

impl std::ops::BitOr for Fault {
    type Output = Fault;
    fn bitor(self, rhs: Fault) -> Fault {
        Fault(self.0 | rhs.0)
    }
}

/// A transport-agnostic status outcome, distinct from any particular HTTP
/// crate's status type so this crate stays free of a network dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    /// 200.
    Ok,
    /// 400.
    BadRequest,
    /// 403.
    Forbidden,
    /// 409.
    Conflict,
    /// 404.
    NotFound,
    /// 500.
    InternalServerError,
    /// 503.
    ServiceUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_has_no_bits() {
        assert!(Fault::accept().is_accept());
        assert_eq!(Fault::accept().reflect(), "ACCEPT");
        assert_eq!(Fault::accept().http_status(), HttpStatus::Ok);
    }

    #[test]
    fn exists_maps_to_conflict() {
        let f = Fault::from_bits(EXISTS);
        assert_eq!(f.http_status(), HttpStatus::Conflict);
        assert_eq!(f.reflect(), "EXISTS");
    }

    #[test]
    fn state_and_event_map_to_not_found() {
        assert_eq!(Fault::from_bits(STATE).http_status(), HttpStatus::NotFound);
        assert_eq!(Fault::from_bits(EVENT).http_status(), HttpStatus::NotFound);
    }

    #[test]
    fn invalid_maps_to_bad_request() {
        assert_eq!(Fault::from_bits(INVALID).http_status(), HttpStatus::BadRequest);
    }

    #[test]
    fn auth_outranks_state_in_reflect() {
        let f = Fault::from_bits(AUTH | STATE);
        assert_eq!(f.reflect(), "AUTH");
    }

    #[test]
    fn interrupt_maps_to_service_unavailable() {
        let f = Fault::from_bits(INTERRUPT);
        assert_eq!(f.http_status(), HttpStatus::ServiceUnavailable);
    }

    #[test]
    fn insert_accumulates_bits() {
        let mut f = Fault::accept();
        f.insert(INVALID);
        f.insert(STATE);
        assert!(f.has(INVALID));
        assert!(f.has(STATE));
        assert!(!f.has(AUTH));
    }
}
