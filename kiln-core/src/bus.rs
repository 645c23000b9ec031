use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Mutation kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Append,
    Finished,
    Attached,
    Detached,
    ShutdownRequested,
    Claimed,
    Released,
}

/// A mutation notification: every topic alias of the resource, the kind of
/// change, and the full current snapshot (never a diff). Events are not
/// persisted; they exist only for the duration of dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topics: Vec<String>,
    pub kind: EventKind,
    pub snapshot: serde_json::Value,
}

impl Event {
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

/// In-process pub/sub for durable mutations.
///
/// Publication happens only after the corresponding store write has
/// committed; a failed write publishes nothing. Events for the same
/// resource are delivered in commit order. There is no replay: a
/// subscriber registered after an event fired never sees it, and a slow
/// subscriber observes `Lagged` rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(kind = ?event.kind, topics = ?event.topics, "publishing event");
        // A send with no live subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
