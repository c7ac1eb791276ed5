//! Event bus (C9): fans out a task's ordered event stream to subscribers.
//! Durability and sequencing live in the store (`store::StoreHandle::
//! append_event`); this module only adds the in-process pub/sub layer on
//! top, grounded on `coordinator.rs`'s mpsc-channel-per-consumer shape.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::error::OrcError;
use crate::record::{Event, EventKind};
use crate::store::StoreHandle;
use crate::log_warn;

/// Bounded per-task broadcast channel. A slow subscriber that falls more
/// than `capacity` events behind drops the oldest ones; `subscribe` on a
/// receiver that lagged sees `RecvError::Lagged`, which callers translate
/// into a synthetic `overflow` marker event rather than propagating the
/// channel-internal error type.
const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    store: StoreHandle,
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new(store: StoreHandle) -> Self {
        Self { store, channels: Mutex::new(HashMap::new()) }
    }

    fn channel_for(&self, task_id: &str) -> broadcast::Sender<Event> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Assigns a durable sequence number via the store, then fans the
    /// event out to any live subscribers. Publishing never fails because
    /// no subscriber is listening; it only fails if the store write
    /// itself fails.
    pub async fn publish(
        &self,
        task_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event, OrcError> {
        let event = self.store.append_event(task_id, kind, payload).await?;
        let sender = self.channel_for(task_id);
        // No receivers is not an error: durable persistence already happened.
        let _ = sender.send(event.clone());
        Ok(event)
    }

    /// Subscribes to live events for one task. Returns a receiver; callers
    /// should call [`next_or_overflow`] in a loop rather than using the
    /// raw `broadcast::Receiver` API directly, so lag is surfaced as a
    /// proper `overflow` event instead of an error the caller must know
    /// to special-case.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<Event> {
        self.channel_for(task_id).subscribe()
    }
}

/// Synthesizes the `overflow` marker event the spec requires when a
/// subscriber's bounded queue drops events: the broadcast channel already
/// dropped the oldest N, so this just records how many and lets the
/// subscriber continue from the next live event.
pub fn overflow_event(task_id: &str, dropped: u64) -> Event {
    Event {
        seq: 0,
        task_id: task_id.to_string(),
        kind: EventKind::Overflow,
        payload: serde_json::json!({ "dropped": dropped }),
        time: chrono::Utc::now(),
    }
}

/// Drains one event from `rx`, translating a lag into an `overflow`
/// marker event rather than an error. Returns `None` when the bus itself
/// has shut down (sender dropped).
pub async fn next_or_overflow(task_id: &str, rx: &mut broadcast::Receiver<Event>) -> Option<Event> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                log_warn!("event subscriber for task {task_id} lagged by {dropped} events");
                return Some(overflow_event(task_id, dropped));
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_live_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        let bus = EventBus::new(store);

        let mut rx = bus.subscribe("WRK-001");
        bus.publish("WRK-001", EventKind::State, serde_json::json!({"status": "running"}))
            .await
            .unwrap();

        let event = next_or_overflow("WRK-001", &mut rx).await.unwrap();
        assert_eq!(event.kind, EventKind::State);
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn published_events_are_durable_even_without_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        let bus = EventBus::new(store.clone());

        bus.publish("WRK-002", EventKind::Phase, serde_json::json!({"phase": "implement"}))
            .await
            .unwrap();

        let events = store.list_events("WRK-002", 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_overflow_marker_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        let bus = EventBus::new(store);
        let mut rx = bus.subscribe("WRK-003");

        for i in 0..(CHANNEL_CAPACITY + 5) {
            bus.publish("WRK-003", EventKind::Tokens, serde_json::json!({"i": i}))
                .await
                .unwrap();
        }

        let event = next_or_overflow("WRK-003", &mut rx).await.unwrap();
        assert_eq!(event.kind, EventKind::Overflow);
    }
}
