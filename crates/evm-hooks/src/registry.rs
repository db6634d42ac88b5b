//! The fixed set of hook sites the EVM pipeline dispatches through (spec
//! §4.D), plus a broadcast channel `vm.notify` handlers can use to fan
//! events out to external subscribers (clients, federation).

use evm_types::Event;
use tokio::sync::broadcast;

use crate::site::Site;

/// Default capacity of the notify broadcast channel, matching the
/// teacher's `InMemoryBus` default.
const DEFAULT_BROADCAST_SIZE: usize = 1024;

/// The registry of named hook sites every EVM pipeline run dispatches
/// through. There is exactly one instance per running VM.
pub struct HookRegistry {
    /// `vm.issue` — local issuance (commit path only).
    pub issue: Site,
    /// `vm.conform` — static event validation.
    pub conform: Site,
    /// `vm.fetch` — dependency resolution.
    pub fetch: Site,
    /// `vm.eval` — semantic evaluation.
    pub eval: Site,
    /// `vm.post` — pre-notify side effects.
    pub post: Site,
    /// `vm.notify` — broadcast to subscribers.
    pub notify: Site,
    /// `vm.effect` — post-notify, best-effort side effects.
    pub effect: Site,

    notify_tx: broadcast::Sender<Event>,
}

impl HookRegistry {
    /// Construct a fresh registry with all seven sites empty.
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Self {
            issue: Site::new("vm.issue"),
            conform: Site::new("vm.conform"),
            fetch: Site::new("vm.fetch"),
            eval: Site::new("vm.eval"),
            post: Site::new("vm.post"),
            notify: Site::new("vm.notify"),
            effect: Site::new("vm.effect"),
            notify_tx,
        }
    }

    /// Subscribe to the notify broadcast stream. A `vm.notify` handler
    /// calls [`HookRegistry::broadcast`] to publish on this channel; any
    /// number of external subscribers (clients, federation senders) may
    /// listen.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notify_tx.subscribe()
    }

    /// Publish `event` on the notify broadcast channel. Errors (no
    /// subscribers) are not propagated; notify delivery is best-effort by
    /// design, matching the spec's `vm.notify` being the fan-out point
    /// rather than a guaranteed-delivery channel.
    pub fn broadcast(&self, event: Event) {
        let _ = self.notify_tx.send(event);
    }

    /// How many receivers are currently subscribed to the notify channel.
    pub fn subscriber_count(&self) -> usize {
        self.notify_tx.receiver_count()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evm_types::id::{RoomId, ServerName, UserId};
    use std::collections::BTreeMap;

    fn sample_event() -> Event {
        Event {
            event_id: None,
            room_id: RoomId::parse("!room:example.org").unwrap(),
            event_type: "m.room.message".to_string(),
            sender: UserId::parse("@alice:example.org").unwrap(),
            state_key: None,
            content: serde_json::json!({}),
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin: ServerName("example.org".to_string()),
            origin_server_ts: 1,
            hashes: BTreeMap::new(),
            signatures: BTreeMap::new(),
            unsigned: None,
        }
    }

    #[test]
    fn fresh_registry_has_no_handlers() {
        let reg = HookRegistry::new();
        assert_eq!(reg.conform.handler_count(), 0);
        assert_eq!(reg.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let reg = HookRegistry::new();
        let mut rx = reg.subscribe();
        reg.broadcast(sample_event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "m.room.message");
    }
}
