//! Lifecycle event notification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Kind of entity an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Image,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Container => write!(f, "container"),
            EventKind::Image => write!(f, "image"),
        }
    }
}

/// Lifecycle transition being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Start,
    Die,
    Detach,
    Pull,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventAction::Create => "create",
            EventAction::Start => "start",
            EventAction::Die => "die",
            EventAction::Detach => "detach",
            EventAction::Pull => "pull",
        };
        f.write_str(s)
    }
}

/// A published lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub action: EventAction,
    pub time: DateTime<Utc>,
}

/// Fire-and-forget receiver of lifecycle events
pub trait EventSink: Send + Sync {
    fn publish(&self, id: &str, kind: EventKind, action: EventAction);
}

/// Broadcast-backed event sink
///
/// Events published while nobody is subscribed are only logged.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn publish(&self, id: &str, kind: EventKind, action: EventAction) {
        tracing::debug!(%id, %kind, %action, "event");
        let event = Event {
            id: id.to_string(),
            kind,
            action,
            time: Utc::now(),
        };
        // No receivers is not an error for a notifier.
        let _ = self.sender.send(event);
    }
}
