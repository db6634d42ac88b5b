//! The per-evaluation context driving one pass through the stage pipeline
//! (spec §3 "Eval", §4.E).
//!
//! Rust has no stable-address, non-movable, non-copyable value the way the
//! original's `eval` base class was; the idiomatic equivalent used here is
//! an `Arc<Eval>` with no `Clone`/`Copy` impl on `Eval` itself, registered
//! in [`crate::registry::EvalRegistry`] by `eval_id` (not by address) and
//! removed on `Drop`. See `DESIGN.md` for the full resolution of this
//! design note.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use evm_hooks::HookContext;
use evm_types::EventId;

use crate::cancel::CancelToken;
use crate::opts::{Copts, Opts};
use crate::registry::EvalRegistry;
use crate::sequence::SequenceNumber;

static NEXT_EVAL_ID: AtomicU64 = AtomicU64::new(1);

/// What `vm.conform` and related stages observed about an event, kept
/// around for diagnostics (spec §3 "conformance report").
#[derive(Debug, Clone, Default)]
pub struct ConformanceReport {
    /// Whether `vm.conform` dispatched without raising a fault.
    pub conform_passed: bool,
}

/// The per-evaluation context (spec §4.E). Constructed via [`Eval::new`],
/// which both allocates an `Arc<Eval>` and registers it; the matching
/// [`Drop`] impl removes it, so lifetime in the registry exactly tracks the
/// `Arc`'s own lifetime.
pub struct Eval {
    id: u64,
    /// The receive-path options this evaluation runs under.
    pub opts: Opts,
    /// Present on the commit (local-issue) path only.
    pub copts: Option<Copts>,
    sequence: AtomicU64,
    committed: AtomicBool,
    event_id: Mutex<Option<EventId>>,
    conformance: Mutex<ConformanceReport>,
    cancel: CancelToken,
    registry: Arc<EvalRegistry>,
}

impl Eval {
    /// Construct and register a new Eval for the receive path.
    pub fn new(registry: Arc<EvalRegistry>, opts: Opts) -> Arc<Self> {
        Self::construct(registry, opts, None)
    }

    /// Construct and register a new Eval for the commit (local-issue) path.
    pub fn new_issue(registry: Arc<EvalRegistry>, copts: Copts) -> Arc<Self> {
        let opts = copts.opts.clone();
        Self::construct(registry, opts, Some(copts))
    }

    fn construct(registry: Arc<EvalRegistry>, opts: Opts, copts: Option<Copts>) -> Arc<Self> {
        let id = NEXT_EVAL_ID.fetch_add(1, Ordering::Relaxed);
        registry.insert(id);
        let cancel = CancelToken::new();
        registry.set_cancel_token(id, cancel.clone());
        Arc::new(Self {
            id,
            opts,
            copts,
            sequence: AtomicU64::new(0),
            committed: AtomicBool::new(false),
            event_id: Mutex::new(None),
            conformance: Mutex::new(ConformanceReport::default()),
            cancel,
            registry,
        })
    }

    /// This evaluation's opaque identifier, stable for its lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The sequence allocated to this evaluation, or `0` before the write
    /// stage acquires one (spec invariant: "allocated sequence (0 if
    /// unassigned)").
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence.load(Ordering::Acquire)
    }

    /// Assign this evaluation's sequence, updating both the atomic and the
    /// shared registry entry.
    pub(crate) fn assign_sequence(&self, seq: SequenceNumber) {
        self.sequence.store(seq, Ordering::Release);
        self.registry.set_sequence(self.id, seq);
    }

    /// Whether `txn.commit()` has succeeded for this evaluation.
    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_committed(&self) {
        self.committed.store(true, Ordering::Release);
    }

    /// This evaluation's computed or matched event id, once known.
    pub fn event_id(&self) -> Option<EventId> {
        self.event_id.lock().expect("eval poisoned").clone()
    }

    pub(crate) fn set_event_id(&self, id: EventId) {
        self.registry.set_event_id(self.id, id.clone());
        *self.event_id.lock().expect("eval poisoned") = Some(id);
    }

    /// A snapshot of this evaluation's conformance report.
    pub fn conformance(&self) -> ConformanceReport {
        self.conformance.lock().expect("eval poisoned").clone()
    }

    pub(crate) fn mark_conform_passed(&self) {
        self.conformance.lock().expect("eval poisoned").conform_passed = true;
    }

    /// The cancel signal this evaluation watches at its suspension points.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Request cooperative cancellation (spec §5 "Cancellation").
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl HookContext for Eval {
    fn sequence(&self) -> u64 {
        Eval::sequence(self)
    }

    fn eval_id(&self) -> u64 {
        self.id
    }
}

impl TryFrom<&Eval> for EventId {
    type Error = ();

    /// "Convertible to its computed `event_id`" (spec §4.E).
    fn try_from(eval: &Eval) -> Result<Self, Self::Error> {
        eval.event_id().ok_or(())
    }
}

impl Drop for Eval {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_and_drop_unregisters() {
        let registry = Arc::new(EvalRegistry::new());
        {
            let eval = Eval::new(registry.clone(), Opts::default());
            assert_eq!(registry.count(), 1);
            assert_eq!(eval.sequence(), 0);
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn assign_sequence_updates_registry_snapshot() {
        let registry = Arc::new(EvalRegistry::new());
        let eval = Eval::new(registry.clone(), Opts::default());
        eval.assign_sequence(3);
        assert_eq!(eval.sequence(), 3);
        assert_eq!(registry.max_sequence(), 3);
    }

    #[test]
    fn try_from_fails_before_event_id_is_set() {
        let registry = Arc::new(EvalRegistry::new());
        let eval = Eval::new(registry, Opts::default());
        assert!(EventId::try_from(eval.as_ref()).is_err());
    }

    #[test]
    fn try_from_succeeds_once_event_id_is_set() {
        let registry = Arc::new(EvalRegistry::new());
        let eval = Eval::new(registry, Opts::default());
        let id = EventId::parse("$a:example.org").unwrap();
        eval.set_event_id(id.clone());
        assert_eq!(EventId::try_from(eval.as_ref()).unwrap(), id);
    }
}
