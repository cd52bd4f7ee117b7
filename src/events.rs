//! Internal event bus bridging lifecycle and agent events to the hub.
//!
//! Everything observable about a session — lifecycle transitions, agent
//! events relayed from the instance stream, queue activity — is published
//! here as `(session_id, action, payload)` and republished onto the [`Hub`]
//! as a notification on that session's channel. A broadcast tap lets other
//! in-process consumers (and tests) observe the same flow without joining
//! the hub.
//!
//! Publishers hold no reference to the lifecycle manager; the bus is the one
//! cycle-breaking seam between stream readers and the client-facing side.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::hub::Hub;
use crate::protocol::WsEnvelope;

/// Capacity of the in-process tap channel.
const TAP_CAPACITY: usize = 256;

/// A published session event.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Dotted action name (`agent.ready`, `agent.event`, `agent.stopped`, …).
    pub action: String,
    /// Event payload.
    pub payload: Value,
}

/// Session-keyed event publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    hub: Arc<Hub>,
    tap: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus that republishes onto `hub`.
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self { hub, tap }
    }

    /// Publish an event for `session_id`.
    ///
    /// The hub notification carries the session id inside the payload so
    /// clients joined to several sessions can demultiplex.
    pub fn publish(&self, session_id: &str, action: &str, payload: Value) {
        let mut enriched = payload;
        if let Value::Object(ref mut map) = enriched {
            map.entry("session_id")
                .or_insert_with(|| Value::String(session_id.to_string()));
        }

        let event = SessionEvent {
            session_id: session_id.to_string(),
            action: action.to_string(),
            payload: enriched.clone(),
        };
        let _ = self.tap.send(event);

        let delivered = self
            .hub
            .broadcast_to_session(session_id, &WsEnvelope::notification(action, enriched));
        log::trace!("[events] {action} for session {session_id} → {delivered} client(s)");
    }

    /// Subscribe to the in-process tap.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tap.subscribe()
    }
}
