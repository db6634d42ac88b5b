//! A room's full lifecycle through the runtime: create, join, message, and
//! a state change, checked against the store directly rather than through
//! the pipeline.

use evm_core::Copts;
use evm_core::compose::{EventBuilder, RoomContext};
use evm_runtime::{test_config, Runtime};
use evm_types::id::{RoomId, UserId};

fn alice() -> UserId {
    UserId::parse("@alice:example.org").unwrap()
}

fn bob() -> UserId {
    UserId::parse("@bob:example.org").unwrap()
}

#[tokio::test]
async fn create_join_message_and_topic_change_are_all_durable() {
    let runtime = Runtime::new(test_config()).await.unwrap();
    let room_id = RoomId::parse("!room:example.org").unwrap();

    let create = EventBuilder::new("m.room.create", alice())
        .with_room_id(room_id.clone())
        .with_state_key("")
        .with_content(serde_json::json!({"creator": "@alice:example.org"}));
    runtime.issue(create, Copts::default(), None, None).await.unwrap();

    let room = RoomContext {
        room_id: room_id.clone(),
        store: runtime.store().as_ref(),
    };

    let join = EventBuilder::new("m.room.member", bob())
        .with_state_key("@bob:example.org")
        .with_content(serde_json::json!({"membership": "join"}));
    runtime.issue(join, Copts::default(), Some(&room), None).await.unwrap();

    let message = EventBuilder::new("m.room.message", bob())
        .with_content(serde_json::json!({"msgtype": "m.text", "body": "hi all"}));
    runtime.issue(message, Copts::default(), Some(&room), None).await.unwrap();

    let topic = EventBuilder::new("m.room.topic", alice())
        .with_state_key("")
        .with_content(serde_json::json!({"topic": "general discussion"}));
    runtime.issue(topic, Copts::default(), Some(&room), None).await.unwrap();

    assert_eq!(runtime.watermarks().await, (4, 4, 4));

    let member_state = runtime
        .store()
        .room_state(&room_id, "m.room.member", "@bob:example.org")
        .await
        .unwrap();
    assert!(member_state.is_some());

    let topic_state = runtime
        .store()
        .room_state(&room_id, "m.room.topic", "")
        .await
        .unwrap();
    assert!(topic_state.is_some());

    let head = runtime.store().room_head(&room_id).await.unwrap();
    assert_eq!(head.len(), 1, "a linear room history has a single head");
}

#[tokio::test]
async fn issuing_into_a_room_with_no_create_event_faults_state() {
    let runtime = Runtime::new(test_config()).await.unwrap();
    let room_id = RoomId::parse("!empty:example.org").unwrap();
    let room = RoomContext {
        room_id,
        store: runtime.store().as_ref(),
    };

    let message = EventBuilder::new("m.room.message", alice())
        .with_content(serde_json::json!({"msgtype": "m.text", "body": "hi"}));
    let err = runtime
        .issue(message, Copts::default(), Some(&room), None)
        .await
        .expect_err("a room with no create event has no head to build on");
    assert!(err.fault.has(evm_types::fault::STATE));
    assert_eq!(runtime.watermarks().await, (0, 0, 0));
}
