//! The process-wide Eval registry (spec §3 "Eval", §4.E, Design Note
//! "cyclic object graphs").
//!
//! Every [`crate::eval::Eval`] is inserted here on construction and removed
//! on drop. The registry is the only place that knows about every
//! in-flight evaluation at once; the sequence allocator (`crate::sequence`)
//! consults it to recompute `max(assigned)` without trusting a watermark
//! that might be stale after a fault unwound an Eval mid-allocation (spec
//! §9 Open Questions).

use std::collections::HashMap;
use std::sync::Mutex;

use evm_types::EventId;

use crate::cancel::CancelToken;

/// A snapshot of one registered Eval's bookkeeping fields, returned by the
/// registry's lookup methods. Cheap to clone; never aliases the Eval
/// itself.
#[derive(Debug, Clone, Default)]
pub struct EvalInfo {
    /// The opaque identifier assigned at construction.
    pub eval_id: u64,
    /// The allocated sequence, or `0` if unassigned.
    pub sequence: u64,
    /// The event id this evaluation concerns, once known.
    pub event_id: Option<EventId>,
}

#[derive(Clone, Default)]
struct RegisteredEval {
    info: EvalInfo,
    cancel: CancelToken,
}

#[derive(Default)]
struct Inner {
    evals: HashMap<u64, RegisteredEval>,
}

/// The registry every running [`crate::vm::Vm`] shares one instance of.
#[derive(Default)]
pub struct EvalRegistry {
    inner: Mutex<Inner>,
}

impl EvalRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly constructed Eval with no sequence assigned yet.
    pub fn insert(&self, eval_id: u64) {
        let mut inner = self.inner.lock().expect("eval registry poisoned");
        inner.evals.insert(
            eval_id,
            RegisteredEval {
                info: EvalInfo {
                    eval_id,
                    sequence: 0,
                    event_id: None,
                },
                cancel: CancelToken::new(),
            },
        );
    }

    /// Remove an Eval, called once on drop (success or fault alike).
    pub fn remove(&self, eval_id: u64) {
        self.inner
            .lock()
            .expect("eval registry poisoned")
            .evals
            .remove(&eval_id);
    }

    /// Record the sequence just allocated to `eval_id`.
    pub fn set_sequence(&self, eval_id: u64, sequence: u64) {
        let mut inner = self.inner.lock().expect("eval registry poisoned");
        if let Some(entry) = inner.evals.get_mut(&eval_id) {
            entry.info.sequence = sequence;
        }
    }

    /// Record the event id `eval_id` concerns, once known (receive path:
    /// immediately; commit path: after composition).
    pub fn set_event_id(&self, eval_id: u64, event_id: EventId) {
        let mut inner = self.inner.lock().expect("eval registry poisoned");
        if let Some(entry) = inner.evals.get_mut(&eval_id) {
            entry.info.event_id = Some(event_id);
        }
    }

    /// Record the cancel token `eval_id` watches, so this registry can
    /// later cancel it by sequence without holding a reference to the
    /// `Eval` itself (spec §5 "Cancellation").
    pub(crate) fn set_cancel_token(&self, eval_id: u64, cancel: CancelToken) {
        let mut inner = self.inner.lock().expect("eval registry poisoned");
        if let Some(entry) = inner.evals.get_mut(&eval_id) {
            entry.cancel = cancel;
        }
    }

    /// The highest sequence currently assigned to any registered Eval, or
    /// `0` if none has been assigned yet. The allocator computes the next
    /// sequence from this rather than trusting the `uncommitted` watermark,
    /// since a faulted Eval between allocate and commit removes itself from
    /// the registry without ever advancing that watermark.
    pub fn max_sequence(&self) -> u64 {
        self.inner
            .lock()
            .expect("eval registry poisoned")
            .evals
            .values()
            .map(|entry| entry.info.sequence)
            .max()
            .unwrap_or(0)
    }

    /// How many Evals are currently registered.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("eval registry poisoned").evals.len()
    }

    /// Find a registered Eval by its allocated sequence.
    pub fn find_by_sequence(&self, sequence: u64) -> Option<EvalInfo> {
        self.inner
            .lock()
            .expect("eval registry poisoned")
            .evals
            .values()
            .find(|entry| entry.info.sequence == sequence)
            .map(|entry| entry.info.clone())
    }

    /// Find a registered Eval by the event id it concerns.
    pub fn find_by_event_id(&self, event_id: &EventId) -> Option<EvalInfo> {
        self.inner
            .lock()
            .expect("eval registry poisoned")
            .evals
            .values()
            .find(|entry| entry.info.event_id.as_ref() == Some(event_id))
            .map(|entry| entry.info.clone())
    }

    /// A snapshot of every currently registered Eval.
    pub fn snapshot(&self) -> Vec<EvalInfo> {
        self.inner
            .lock()
            .expect("eval registry poisoned")
            .evals
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Request cancellation of whichever registered Eval currently holds
    /// `sequence`, returning whether one was found. Lets an external caller
    /// (an admin surface, or a test driving the commit barrier) interrupt an
    /// in-flight evaluation without needing a live `Arc<Eval>` handle.
    pub fn cancel_by_sequence(&self, sequence: u64) -> bool {
        let inner = self.inner.lock().expect("eval registry poisoned");
        match inner.evals.values().find(|entry| entry.info.sequence == sequence) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}
