//! The Event Virtual Machine: the stage pipeline driving every event,
//! durable or ephemeral, local or received, through `issue → conform →
//! fetch → eval → write → post → notify → effect` (spec §4.F).

use std::sync::Arc;

use evm_auth::{Signer, Verifier};
use evm_hooks::HookRegistry;
use evm_store::{TransactionStore, WriteOpts};
use evm_types::digest::Digest;
use evm_types::{fault, Event, EventId, Fault};

use crate::compose::{compose, EventBuilder, RoomContext};
use crate::config::VmConfig;
use crate::error::{apply_policy, invalid_fault, store_fault, VmError};
use crate::eval::Eval;
use crate::opts::{Copts, Opts};
use crate::pool::PostPool;
use crate::registry::EvalRegistry;
use crate::sequence::SequenceDock;

/// A running Event Virtual Machine: one hook registry, one sequence dock,
/// one eval registry, and one backing store (spec §1, §2).
pub struct Vm {
    /// The named hook sites every stage dispatches through.
    pub hooks: HookRegistry,
    store: Arc<dyn TransactionStore>,
    dock: SequenceDock,
    registry: Arc<EvalRegistry>,
    pool: PostPool,
    config: VmConfig,
    digest: Arc<dyn Digest>,
    verifier: Option<Arc<dyn Verifier>>,
}

impl Vm {
    /// Construct a fresh VM over `store`, resuming the sequence dock from
    /// the store's recorded high-water mark (spec §6 "Persisted state
    /// layout").
    pub async fn new(
        store: Arc<dyn TransactionStore>,
        digest: Arc<dyn Digest>,
        config: VmConfig,
    ) -> Result<Self, VmError> {
        let baseline = store.max_index().await.map_err(store_fault)?;
        Ok(Self {
            hooks: HookRegistry::new(),
            store,
            dock: SequenceDock::new(baseline),
            registry: Arc::new(EvalRegistry::new()),
            pool: PostPool::new(config.pool_size),
            config,
            digest,
            verifier: None,
        })
    }

    /// Attach a signature verifier, required for any eval run with
    /// `opts.verify` set.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// The eval registry this VM shares across every pipeline run, exposed
    /// for diagnostics (spec §3 "Eval").
    pub fn eval_registry(&self) -> &Arc<EvalRegistry> {
        &self.registry
    }

    /// The current `(uncommitted, committed, retired)` watermarks.
    pub async fn watermarks(&self) -> (u64, u64, u64) {
        self.dock.watermarks().await
    }

    /// Compose and run a locally issued event through the full pipeline
    /// (spec §4.G then §4.F). `room` is required for any event but
    /// `m.room.create`.
    pub async fn issue(
        &self,
        builder: EventBuilder,
        copts: Copts,
        room: Option<&RoomContext<'_>>,
        signer: Option<&dyn Signer>,
    ) -> Result<Fault, VmError> {
        let nothrows = copts.opts.nothrows;
        let errorlog = copts.opts.errorlog;
        let warnlog = copts.opts.warnlog;
        let result = self.issue_inner(builder, copts, room, signer).await;
        apply_policy(nothrows, errorlog, warnlog, result)
    }

    async fn issue_inner(
        &self,
        builder: EventBuilder,
        copts: Copts,
        room: Option<&RoomContext<'_>>,
        signer: Option<&dyn Signer>,
    ) -> Result<(), VmError> {
        let event = compose(builder, &copts, room, signer, self.digest.as_ref()).await?;
        let eval = Eval::new_issue(self.registry.clone(), copts);
        self.run_pipeline(&eval, event).await
    }

    /// Run a received event (already fully formed, e.g. via federation)
    /// through the pipeline (spec §4.F).
    pub async fn receive(&self, event: Event, opts: Opts) -> Result<Fault, VmError> {
        let nothrows = opts.nothrows;
        let errorlog = opts.errorlog;
        let warnlog = opts.warnlog;
        let eval = Eval::new(self.registry.clone(), opts);
        let result = self.run_pipeline(&eval, event).await;
        apply_policy(nothrows, errorlog, warnlog, result)
    }

    async fn run_pipeline(&self, eval: &Arc<Eval>, event: Event) -> Result<(), VmError> {
        if let Some(copts) = &eval.copts {
            if copts.issue {
                self.hooks.issue.dispatch(&event, eval.as_ref()).await?;
            }
        }

        if eval.opts.conform {
            self.hooks.conform.dispatch(&event, eval.as_ref()).await?;
            eval.mark_conform_passed();
        }

        if event.is_ephemeral() {
            self.eval_edu(eval, event).await
        } else {
            self.eval_pdu(eval, event).await
        }
    }

    async fn eval_edu(&self, eval: &Arc<Eval>, event: Event) -> Result<(), VmError> {
        if eval.opts.eval {
            self.hooks.eval.dispatch(&event, eval.as_ref()).await?;
        }
        self.log_accept(&event, 0);
        Ok(())
    }

    async fn eval_pdu(&self, eval: &Arc<Eval>, event: Event) -> Result<(), VmError> {
        let event_id = event
            .event_id
            .clone()
            .ok_or_else(|| VmError::new(Fault::from_bits(fault::INVALID), "durable event has no event_id"))?;

        // Step 1: replay guard.
        if self.store.exists(&event_id).await.map_err(store_fault)? && !eval.opts.replays {
            return Err(VmError::new(Fault::from_bits(fault::EXISTS), "event already exists"));
        }

        // Step 2: signature verification.
        if eval.opts.verify {
            self.verify_signatures(&event).await?;
        }

        // Step 3: fetch.
        if eval.opts.fetch {
            self.cancellable(eval, self.hooks.fetch.dispatch(&event, eval.as_ref()))
                .await??;
        }
        self.check_dependencies(&event, eval).await?;

        // Step 4: sequence acquire.
        let seq = self.dock.allocate(self.registry.max_sequence()).await;
        eval.assign_sequence(seq);

        let outcome = self.eval_pdu_sequenced(eval, &event).await;

        if eval.opts.write {
            if !eval.committed() {
                self.dock.advance_committed(seq).await;
            }
            self.dock.wait_for_retire_turn(seq).await;
            self.dock.advance_retired(seq).await;
        }

        outcome?;
        eval.set_event_id(event_id);
        self.log_accept(&event, seq);
        Ok(())
    }

    /// Steps 5–11: eval, write, post, notify, effect. Deliberately excludes
    /// the retire wait — the caller in [`Vm::eval_pdu`] always settles the
    /// commit and retire watermarks after this returns, whatever it
    /// returns, so a fault here never leaves a gap in the sequence (spec
    /// §5, §8 boundary scenario 6).
    async fn eval_pdu_sequenced(&self, eval: &Arc<Eval>, event: &Event) -> Result<(), VmError> {
        if eval.opts.eval {
            self.hooks.eval.dispatch(event, eval.as_ref()).await?;
        }

        if eval.opts.write {
            self.write_stage(eval, event).await?;
        }

        if eval.opts.post {
            self.post_stage(eval, event).await?;
        }

        if eval.opts.notify {
            self.hooks.notify.dispatch(event, eval.as_ref()).await?;
            self.hooks.broadcast(event.clone());
        }

        if eval.opts.effects {
            self.hooks.effect.dispatch(event, eval.as_ref()).await?;
        }

        Ok(())
    }

    async fn write_stage(&self, eval: &Arc<Eval>, event: &Event) -> Result<(), VmError> {
        let seq = eval.sequence();
        let canonical_len = event.canonical_bytes().map_err(invalid_fault)?.len();
        let reserved_bytes = evm_store::reserve_bytes_for(canonical_len);

        if event.event_type != "m.room.create" && (eval.opts.history || eval.opts.head_must_exist) {
            let head = self.store.room_head(&event.room_id).await.map_err(store_fault)?;
            if head.is_empty() {
                return Err(VmError::new(Fault::from_bits(fault::STATE), format!("room {} has no head", event.room_id)));
            }
        }

        let mut txn = self.store.open_txn(reserved_bytes, 1).await;
        let write_opts = WriteOpts {
            present: eval.opts.present,
            history: eval.opts.history,
            room_head: eval.opts.room_head,
            room_refs: eval.opts.room_refs,
            json_source: eval.opts.json_source,
            event_idx: seq,
            root_in: None,
            root_out: None,
        };
        self.store.stage_write(&mut txn, event.clone(), write_opts);

        // Commit-turn wait is cancellable: if interrupted here, no log
        // write has occurred, satisfying "no log write occurred" under
        // cancellation (spec §8 boundary scenario 6).
        self.cancellable(eval, self.dock.wait_for_commit_turn(seq)).await?;

        self.store.commit(txn).await.map_err(store_fault)?;
        eval.mark_committed();
        self.dock.advance_committed(seq).await;

        if self.config.log_commit_debug {
            tracing::debug!(sequence = seq, event = %event.pretty_oneline(), "committed");
        }
        Ok(())
    }

    /// Dispatch `vm.post`, bounded by the post worker pool (spec §6
    /// `vm.pool.size`). Multiple evaluations already run concurrently as
    /// separate calls into this `Vm`; the pool's semaphore is what actually
    /// caps how many of their `vm.post` dispatches overlap.
    async fn post_stage(&self, eval: &Arc<Eval>, event: &Event) -> Result<(), VmError> {
        let _permit = self.pool.acquire_owned().await;
        self.hooks.post.dispatch(event, eval.as_ref()).await?;
        Ok(())
    }

    async fn verify_signatures(&self, event: &Event) -> Result<(), VmError> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| VmError::new(Fault::from_bits(fault::GENERAL), "no verifier configured"))?;
        let bytes = event.canonical_bytes().map_err(invalid_fault)?;
        for (server, by_key) in &event.signatures {
            for (key_id, signature) in by_key {
                let server_name = evm_types::id::ServerName(server.clone());
                verifier
                    .verify(&server_name, key_id, &bytes, signature)
                    .await
                    .map_err(|e| VmError::new(Fault::from_bits(fault::GENERAL), e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn check_dependencies(&self, event: &Event, eval: &Arc<Eval>) -> Result<(), VmError> {
        if eval.opts.fetch_prev_wait {
            for id in &event.prev_events {
                self.require_exists(id).await?;
            }
        }
        if eval.opts.fetch_auth_wait {
            for id in &event.auth_events {
                self.require_exists(id).await?;
            }
        }
        Ok(())
    }

    async fn require_exists(&self, id: &EventId) -> Result<(), VmError> {
        if !self.store.exists(id).await.map_err(store_fault)? {
            return Err(VmError::new(Fault::from_bits(fault::EVENT), format!("missing dependency {id}")));
        }
        Ok(())
    }

    /// Log an accepted evaluation, gated by `vm.log.accept.debug` /
    /// `vm.log.accept.info` (spec §6; SPEC_FULL §6 "accept logging gated by
    /// the config toggles above"). Called once the full pipeline has
    /// returned `ACCEPT` for `event` — `seq` is `0` for ephemeral events,
    /// which never acquire a sequence.
    fn log_accept(&self, event: &Event, seq: u64) {
        if self.config.log_accept_debug {
            tracing::debug!(sequence = seq, event = %event.pretty_oneline(), "accepted");
        }
        if self.config.log_accept_info {
            tracing::info!(sequence = seq, event = %event.pretty_oneline(), "accepted");
        }
    }

    /// Race `fut` against this eval's cancel signal, surfacing `INTERRUPT`
    /// if cancellation wins (spec §5 "Cancellation"). Applied only at
    /// suspension points where bailing out early leaves no partial durable
    /// state: the fetch dispatch and the commit-turn wait.
    async fn cancellable<F, T>(&self, eval: &Arc<Eval>, fut: F) -> Result<T, VmError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = eval.cancel_token().cancelled() => {
                Err(VmError::new(Fault::from_bits(fault::INTERRUPT), "evaluation interrupted"))
            }
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evm_auth::Sha256Digest;
    use evm_store_memory::MemoryStore;
    use evm_types::id::{RoomId, UserId};

    fn alice() -> UserId {
        UserId::parse("@alice:example.org").unwrap()
    }

    fn vm_over(store: Arc<MemoryStore>) -> Vm {
        Vm {
            hooks: HookRegistry::new(),
            store: store as Arc<dyn TransactionStore>,
            dock: SequenceDock::new(0),
            registry: Arc::new(EvalRegistry::new()),
            pool: PostPool::new(4),
            config: VmConfig::default(),
            digest: Arc::new(Sha256Digest),
            verifier: None,
        }
    }

    #[tokio::test]
    async fn issuing_create_then_message_allocates_sequential_sequences() {
        let store = Arc::new(MemoryStore::new());
        let vm = vm_over(store);
        let room_id = RoomId::parse("!r:example.org").unwrap();

        let create = EventBuilder::new("m.room.create", alice())
            .with_room_id(room_id.clone())
            .with_state_key("")
            .with_content(serde_json::json!({"creator": "@alice:example.org"}));
        let fault = vm.issue(create, Copts::default(), None, None).await.unwrap();
        assert!(fault.is_accept());
        assert_eq!(vm.watermarks().await, (1, 1, 1));

        let message = EventBuilder::new("m.room.message", alice())
            .with_content(serde_json::json!({"msgtype": "m.text", "body": "hi"}));
        let room = RoomContext {
            room_id,
            store: vm_store(&vm),
        };
        let fault = vm.issue(message, Copts::default(), Some(&room), None).await.unwrap();
        assert!(fault.is_accept());
        assert_eq!(vm.watermarks().await, (2, 2, 2));
    }

    #[tokio::test]
    async fn replaying_an_existing_event_faults_exists_without_throwing() {
        let store = Arc::new(MemoryStore::new());
        let vm = vm_over(store);
        let room_id = RoomId::parse("!r:example.org").unwrap();

        let create = EventBuilder::new("m.room.create", alice())
            .with_room_id(room_id)
            .with_state_key("")
            .with_content(serde_json::json!({"creator": "@alice:example.org"}));
        let event = compose(create, &Copts::default(), None, None, vm.digest.as_ref())
            .await
            .unwrap();

        let opts = Opts::default();
        let first = vm.receive(event.clone(), opts.clone()).await.unwrap();
        assert!(first.is_accept());

        let replay = vm.receive(event, opts).await.unwrap();
        assert!(replay.has(fault::EXISTS));
    }

    #[tokio::test]
    async fn missing_prev_event_faults_event_without_gapping_sequence() {
        let store = Arc::new(MemoryStore::new());
        let vm = vm_over(store);
        let room_id = RoomId::parse("!r:example.org").unwrap();

        let missing_prev = EventId::parse("$missing:example.org").unwrap();
        let event = Event {
            event_id: Some(EventId::parse("$e:example.org").unwrap()),
            room_id,
            event_type: "m.room.message".to_string(),
            sender: alice(),
            state_key: None,
            content: serde_json::json!({}),
            prev_events: vec![missing_prev],
            auth_events: vec![],
            depth: 1,
            origin: evm_types::id::ServerName("example.org".to_string()),
            origin_server_ts: 0,
            hashes: Default::default(),
            signatures: Default::default(),
            unsigned: None,
        };

        let fault = vm.receive(event, Opts::default()).await.unwrap_err();
        assert!(fault.fault.has(fault::EVENT));
        // The sequence dock was never touched: no gap was introduced.
        assert_eq!(vm.watermarks().await, (0, 0, 0));
    }

    fn vm_store(vm: &Vm) -> &dyn TransactionStore {
        vm.store.as_ref()
    }
}
