use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications about what the writer, watcher and session did, for callers
/// that want to observe activity without wrapping every call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    Committed { keys: Vec<String> },
    Incremented { key: String, value: i64 },
    Claimed { key: String },
    Watching { id: Uuid, key: String },
    WatchFailed { id: Uuid, key: String, message: String },
    Cancelled { id: Uuid },
    SessionChanged { user: Option<String> },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
