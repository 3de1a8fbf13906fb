//! Lifecycle events emitted by the service manager and backend supervisor.
//!
//! Events are fanned out through a `tokio::sync::broadcast` channel. The UI
//! layer (or the headless host) subscribes and forwards them outward; nothing
//! here persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Alias under which backend events are published.
pub const BACKEND_ALIAS: &str = "backend";

const EVENT_CAPACITY: usize = 256;

/// What happened to a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    /// Backend passed its readiness check.
    Ready,
    Stopped,
    Crashed,
}

impl std::fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleKind::Started => write!(f, "started"),
            LifecycleKind::Ready => write!(f, "ready"),
            LifecycleKind::Stopped => write!(f, "stopped"),
            LifecycleKind::Crashed => write!(f, "crashed"),
        }
    }
}

/// A single lifecycle transition of an aliased process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub alias: String,
    pub kind: LifecycleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(alias: impl Into<String>, kind: LifecycleKind, exit_code: Option<i32>) -> Self {
        Self {
            alias: alias.into(),
            kind,
            exit_code,
            timestamp: Utc::now(),
        }
    }

    /// Outward channel name consumed by the UI layer, e.g. `service-started`.
    pub fn channel(&self) -> String {
        let scope = if self.alias == BACKEND_ALIAS {
            "backend"
        } else {
            "service"
        };
        format!("{scope}-{}", self.kind)
    }
}

/// Cloneable fan-out handle for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, returning how many subscribers received it.
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        tracing::debug!(alias = %event.alias, kind = %event.kind, exit_code = ?event.exit_code, "lifecycle event");
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(
            bus.publish(LifecycleEvent::new("embedding", LifecycleKind::Started, None)),
            0
        );
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(LifecycleEvent::new("rerank", LifecycleKind::Started, None));
        bus.publish(LifecycleEvent::new("rerank", LifecycleKind::Stopped, Some(137)));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, LifecycleKind::Started);
        assert_eq!(second.kind, LifecycleKind::Stopped);
        assert_eq!(second.exit_code, Some(137));
    }

    #[test]
    fn test_channel_names() {
        let started = LifecycleEvent::new("embedding", LifecycleKind::Started, None);
        assert_eq!(started.channel(), "service-started");
        let crashed = LifecycleEvent::new(BACKEND_ALIAS, LifecycleKind::Crashed, Some(1));
        assert_eq!(crashed.channel(), "backend-crashed");
    }

    #[test]
    fn test_event_json_shape() {
        let event = LifecycleEvent::new("vision", LifecycleKind::Stopped, Some(0));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["alias"], "vision");
        assert_eq!(json["kind"], "stopped");
        assert_eq!(json["exit_code"], 0);
    }
}
