//! End-to-end pipeline scenarios (spec §8 "End-to-end scenarios with
//! literal values"): compose a room create, then a message building on it,
//! with hooks registered at every stage observing dispatch order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use evm_auth::Sha256Digest;
use evm_core::compose::{EventBuilder, RoomContext};
use evm_core::opts::Copts;
use evm_core::vm::Vm;
use evm_core::VmConfig;
use evm_hooks::{Hook, HookContext, HookFault, MatchClause};
use evm_store::TransactionStore;
use evm_store_memory::MemoryStore;
use evm_types::id::{RoomId, UserId};
use evm_types::Event;

struct RecordingHook {
    site: &'static str,
    log: Arc<std::sync::Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Hook for RecordingHook {
    async fn call(&self, _event: &Event, _ctx: &dyn HookContext) -> Result<(), HookFault> {
        self.log.lock().unwrap().push(self.site);
        Ok(())
    }
}

fn alice() -> UserId {
    UserId::parse("@alice:example.org").unwrap()
}

#[tokio::test]
async fn create_then_message_dispatches_every_stage_in_order() {
    let store = Arc::new(MemoryStore::new());
    let mut vm = Vm::new(store.clone(), Arc::new(Sha256Digest), VmConfig::default())
        .await
        .unwrap();

    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    for (site_name, site) in [
        ("issue", &mut vm.hooks.issue),
        ("conform", &mut vm.hooks.conform),
        ("fetch", &mut vm.hooks.fetch),
        ("eval", &mut vm.hooks.eval),
        ("post", &mut vm.hooks.post),
        ("notify", &mut vm.hooks.notify),
        ("effect", &mut vm.hooks.effect),
    ] {
        site.register(
            MatchClause::any(),
            Arc::new(RecordingHook {
                site: site_name,
                log: log.clone(),
            }),
        );
    }

    let room_id = RoomId::parse("!room:example.org").unwrap();
    let create = EventBuilder::new("m.room.create", alice())
        .with_room_id(room_id.clone())
        .with_state_key("")
        .with_content(serde_json::json!({"creator": "@alice:example.org"}));

    let fault = vm.issue(create, Copts::default(), None, None).await.unwrap();
    assert!(fault.is_accept());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["issue", "conform", "fetch", "eval", "post", "notify", "effect"]
    );
    assert_eq!(vm.watermarks().await, (1, 1, 1));

    log.lock().unwrap().clear();

    let message = EventBuilder::new("m.room.message", alice())
        .with_content(serde_json::json!({"msgtype": "m.text", "body": "hi"}));
    let room = RoomContext {
        room_id,
        store: store.as_ref(),
    };
    let fault = vm
        .issue(message, Copts::default(), Some(&room), None)
        .await
        .unwrap();
    assert!(fault.is_accept());
    assert_eq!(vm.watermarks().await, (2, 2, 2));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["issue", "conform", "fetch", "eval", "post", "notify", "effect"]
    );
    assert_eq!(store.event_count().await, 2);
}

#[tokio::test]
async fn notify_subscribers_receive_every_accepted_event_in_sequence_order() {
    let store = Arc::new(MemoryStore::new());
    let vm = Vm::new(store.clone(), Arc::new(Sha256Digest), VmConfig::default())
        .await
        .unwrap();
    let mut rx = vm.hooks.subscribe();

    let room_id = RoomId::parse("!room:example.org").unwrap();
    let create = EventBuilder::new("m.room.create", alice())
        .with_room_id(room_id.clone())
        .with_state_key("")
        .with_content(serde_json::json!({"creator": "@alice:example.org"}));
    vm.issue(create, Copts::default(), None, None).await.unwrap();

    let message = EventBuilder::new("m.room.message", alice())
        .with_content(serde_json::json!({"msgtype": "m.text", "body": "hi"}));
    let room = RoomContext {
        room_id,
        store: store.as_ref(),
    };
    vm.issue(message, Copts::default(), Some(&room), None)
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.event_type, "m.room.create");
    assert_eq!(second.event_type, "m.room.message");
}

#[tokio::test]
async fn post_stage_runs_for_every_event_even_when_sequenced_concurrently() {
    let store = Arc::new(MemoryStore::new());
    let vm = Arc::new(
        Vm::new(store.clone(), Arc::new(Sha256Digest), VmConfig::default())
            .await
            .unwrap(),
    );

    let room_id = RoomId::parse("!room:example.org").unwrap();
    let create = EventBuilder::new("m.room.create", alice())
        .with_room_id(room_id.clone())
        .with_state_key("")
        .with_content(serde_json::json!({"creator": "@alice:example.org"}));
    vm.issue(create, Copts::default(), None, None).await.unwrap();

    let post_count = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..4 {
        let vm = vm.clone();
        let store = store.clone();
        let room_id = room_id.clone();
        let post_count = post_count.clone();
        handles.push(tokio::spawn(async move {
            let message = EventBuilder::new("m.room.message", alice())
                .with_content(serde_json::json!({"msgtype": "m.text", "body": format!("msg {i}")}));
            let room = RoomContext {
                room_id,
                store: store.as_ref(),
            };
            let fault = vm
                .issue(message, Copts::default(), Some(&room), None)
                .await
                .unwrap();
            assert!(fault.is_accept());
            post_count.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(post_count.load(Ordering::SeqCst), 4);
    assert_eq!(vm.watermarks().await, (5, 5, 5));
    assert_eq!(store.event_count().await, 5);
}
