//! Per-evaluation options (spec §4.E): `Opts` governs the receive path,
//! `Copts` extends it with the fields a local-issue (commit) path needs.

use evm_types::fault::{self, Fault};

/// All eight fault bits or'd together, used to express "every fault but
/// one" defaults below.
const ALL_FAULTS: u32 = fault::ACCEPT
    | fault::EXISTS
    | fault::GENERAL
    | fault::INVALID
    | fault::AUTH
    | fault::STATE
    | fault::EVENT
    | fault::INTERRUPT;

/// Per-evaluation switches governing which pipeline stages run and how
/// faults are reported (spec §4.E, §4.H).
#[derive(Debug, Clone)]
pub struct Opts {
    /// Run `vm.conform`.
    pub conform: bool,
    /// Verify the event's signatures before fetch.
    pub verify: bool,
    /// Run `vm.fetch`.
    pub fetch: bool,
    /// Block until missing `auth_events` are resolved.
    pub fetch_auth_wait: bool,
    /// Block until missing room state is resolved.
    pub fetch_state_wait: bool,
    /// Block until missing `prev_events` are resolved.
    pub fetch_prev_wait: bool,
    /// Allocate a sequence and write to the log.
    pub write: bool,
    /// Run `vm.eval`.
    pub eval: bool,
    /// Run `vm.post`.
    pub post: bool,
    /// Run `vm.notify`.
    pub notify: bool,
    /// Run `vm.effect`.
    pub effects: bool,
    /// Allow re-evaluating an event id that already exists, rather than
    /// faulting `EXISTS`.
    pub replays: bool,
    /// Update the room's present state map on write.
    pub present: bool,
    /// Update the room's state tree (history) on write.
    pub history: bool,
    /// Add this event to the room head set on write.
    pub room_head: bool,
    /// Remove this event's `prev_events` from the room head set on write.
    pub room_refs: bool,
    /// Fault `STATE` if the room has no head, even for non-state events.
    pub head_must_exist: bool,
    /// Trust the caller's serialized bytes rather than re-serializing at
    /// write time.
    pub json_source: bool,
    /// Faults in this mask are returned as a value instead of raised.
    pub nothrows: Fault,
    /// Faults in this mask are logged at error level.
    pub errorlog: Fault,
    /// Faults in this mask are logged at warning level.
    pub warnlog: Fault,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            conform: true,
            verify: false,
            fetch: true,
            fetch_auth_wait: true,
            fetch_state_wait: true,
            fetch_prev_wait: true,
            write: true,
            eval: true,
            post: true,
            notify: true,
            effects: true,
            replays: false,
            present: true,
            history: true,
            room_head: true,
            room_refs: true,
            head_must_exist: false,
            json_source: false,
            nothrows: Fault::from_bits(fault::EXISTS),
            errorlog: Fault::from_bits(!fault::EXISTS & ALL_FAULTS),
            warnlog: Fault::from_bits(fault::EXISTS),
        }
    }
}

/// Composition options for a locally issued event (spec §4.E, §4.G),
/// extending [`Opts`] with the commit-composer's injection flags.
#[derive(Debug, Clone)]
pub struct Copts {
    /// The underlying receive-path options this commit also runs under.
    pub opts: Opts,
    /// The client-supplied transaction id for idempotent resubmission.
    pub client_txnid: Option<String>,
    /// Inject `origin`.
    pub add_origin: bool,
    /// Inject `origin_server_ts`.
    pub add_origin_server_ts: bool,
    /// Compute and inject `hashes`.
    pub add_hash: bool,
    /// Compute and inject `signatures`.
    pub add_sig: bool,
    /// Compute and inject `event_id`.
    pub add_event_id: bool,
    /// Compute and inject `prev_events` from the room head.
    pub add_prev_events: bool,
    /// Inject an (empty) `prev_state` marker.
    pub add_prev_state: bool,
    /// Compute and inject `auth_events`.
    pub add_auth_events: bool,
    /// Run `vm.issue` before `vm.conform`.
    pub issue: bool,
}

impl Default for Copts {
    fn default() -> Self {
        Self {
            opts: Opts::default(),
            client_txnid: None,
            add_origin: true,
            add_origin_server_ts: true,
            add_hash: true,
            add_sig: true,
            add_event_id: true,
            add_prev_events: true,
            add_prev_state: false,
            add_auth_events: true,
            issue: true,
        }
    }
}
