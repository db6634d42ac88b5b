//! A single named hook site: an ordered list of handlers, each gated by a
//! match clause, dispatched sequentially (spec §4.D).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use evm_types::Event;

/// Context handed to a hook alongside the event it fired for. `evm-core`'s
/// `Eval` implements this so handlers can consult the allocated sequence or
/// flag a fault without this crate depending on `evm-core`.
pub trait HookContext: Send + Sync {
    /// The sequence number assigned to this evaluation, or `0` if
    /// unassigned (ephemeral events, or before sequence acquire).
    fn sequence(&self) -> u64;

    /// An opaque identifier for the evaluation, used in tracing spans.
    fn eval_id(&self) -> u64;
}

/// A no-op context, used for ephemeral events or in tests where sequence
/// information is not meaningful.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullContext;

impl HookContext for NullContext {
    fn sequence(&self) -> u64 {
        0
    }

    fn eval_id(&self) -> u64 {
        0
    }
}

/// An error a hook raises, carrying the fault bits the pipeline should
/// attribute to the evaluation (spec §4.H: "a typed VM error carries its own
/// fault code").
#[derive(Debug, thiserror::Error)]
#[error("hook fault: {fault}")]
pub struct HookFault {
    /// The fault bits raised by the hook.
    pub fault: evm_types::Fault,
    /// A human-readable reason, included in logs.
    pub reason: String,
}

impl HookFault {
    /// Construct a hook fault from raw bits and a reason string.
    pub fn new(fault: evm_types::Fault, reason: impl Into<String>) -> Self {
        Self {
            fault,
            reason: reason.into(),
        }
    }
}

/// A handler registered at a site.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Run this handler against `event`. Returning `Err` immediately stops
    /// dispatch at this site; subsequent handlers do not run (spec §4.D).
    async fn call(&self, event: &Event, ctx: &dyn HookContext) -> Result<(), HookFault>;
}

/// An equality-based predicate over named event fields. Matching is an AND
/// of the clauses present; a `None` clause matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchClause {
    /// Restrict to this event type, e.g. `"m.room.redaction"`.
    pub event_type: Option<String>,
    /// Restrict to this originating server name.
    pub origin: Option<String>,
    /// Restrict to this sender.
    pub sender: Option<String>,
    /// Restrict to this room.
    pub room_id: Option<String>,
}

impl MatchClause {
    /// A clause matching any event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict by event type.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Restrict by origin server.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Restrict by sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Restrict by room.
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(t) = &self.event_type {
            if t != &event.event_type {
                return false;
            }
        }
        if let Some(o) = &self.origin {
            if o != &event.origin.0 {
                return false;
            }
        }
        if let Some(s) = &self.sender {
            if s != event.sender.as_str() {
                return false;
            }
        }
        if let Some(r) = &self.room_id {
            if r != event.room_id.as_str() {
                return false;
            }
        }
        true
    }
}

/// An opaque handle to a registered hook, used to unregister it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

struct Registration {
    handle: HookHandle,
    clause: MatchClause,
    hook: Arc<dyn Hook>,
}

/// A named dispatch point. Handlers run sequentially in registration order;
/// the first to fault stops dispatch for the remaining handlers at this
/// site (spec §4.D).
#[derive(Default)]
pub struct Site {
    name: &'static str,
    handlers: Vec<Registration>,
}

impl Site {
    /// Construct an empty site with the given name (e.g. `"vm.conform"`).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Vec::new(),
        }
    }

    /// This site's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// How many handlers are currently registered.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Register `hook` under `clause`, appended after any existing
    /// registrations (dispatch runs in registration order).
    pub fn register(&mut self, clause: MatchClause, hook: Arc<dyn Hook>) -> HookHandle {
        let handle = HookHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.handlers.push(Registration {
            handle,
            clause,
            hook,
        });
        handle
    }

    /// Remove a previously registered handler. No-op if already removed.
    pub fn unregister(&mut self, handle: HookHandle) {
        self.handlers.retain(|r| r.handle != handle);
    }

    /// Dispatch `event` to every matching handler in registration order.
    /// Stops and returns the first fault raised.
    pub async fn dispatch(
        &self,
        event: &Event,
        ctx: &dyn HookContext,
    ) -> Result<(), HookFault> {
        for reg in &self.handlers {
            if !reg.clause.matches(event) {
                continue;
            }
            tracing::debug!(site = self.name, event_type = %event.event_type, "dispatching hook");
            reg.hook.call(event, ctx).await?;
        }
        Ok(())
    }
}
