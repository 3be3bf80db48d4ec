//! Broadcast of agent events to live subscribers.
//!
//! One bus fans out to every WebSocket client. Log lines arrive through the
//! [`NotificationSink`] impl; state snapshots are published by the HTTP layer
//! after each mutating call.
//!
//! # Example
//!
//! ```rust
//! use deckhand_core::event_bus::{EventBus, AGENT_LOG};
//! use deckhand_core::{AgentId, NotificationSink};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.on_log_line(&AgentId::from("agent-1"), "hello");
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.event_type, AGENT_LOG);
//! assert_eq!(event.payload["line"], "hello");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::agents::{AgentId, AgentView};
use crate::sink::NotificationSink;

/// Events beyond this many unread cause slow subscribers to lag.
const DEFAULT_CAPACITY: usize = 1024;

pub const AGENT_LOG: &str = "agent:log";
pub const AGENT_CREATED: &str = "agent:created";
pub const AGENT_UPDATE: &str = "agent:update";
pub const AGENT_STOPPED: &str = "agent:stopped";
pub const SERVER_SHUTDOWN: &str = "server:shutdown";

/// An event as delivered to subscribers; serializes to `{type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    pub payload: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Payload of [`AGENT_LOG`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLinePayload {
    pub agent_id: AgentId,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it; with none, the
    /// event is dropped and 0 is returned.
    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> usize {
        let json_payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to serialize {} payload: {}", event_type, e);
                return 0;
            }
        };

        self.sender
            .send(BroadcastEvent::new(event_type, json_payload))
            .unwrap_or(0)
    }

    pub fn agent_created(&self, agent: &AgentView) -> usize {
        self.emit(AGENT_CREATED, &json!({ "agent": agent }))
    }

    pub fn agent_updated(&self, agent: &AgentView) -> usize {
        self.emit(AGENT_UPDATE, &json!({ "agent": agent }))
    }

    pub fn agent_stopped(&self, agent: &AgentView) -> usize {
        self.emit(
            AGENT_STOPPED,
            &json!({ "agentId": agent.id, "agent": agent }),
        )
    }

    pub fn server_shutdown(&self) -> usize {
        self.emit(
            SERVER_SHUTDOWN,
            &json!({ "message": "Server is shutting down" }),
        )
    }

    /// Past events are not delivered to new subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for EventBus {
    fn on_log_line(&self, agent_id: &AgentId, line: &str) {
        self.emit(
            AGENT_LOG,
            &LogLinePayload {
                agent_id: agent_id.clone(),
                line: line.to_string(),
                timestamp: Utc::now(),
            },
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
