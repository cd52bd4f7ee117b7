//! Per-session pending-message queue.
//!
//! While an agent is mid-turn, the user can keep typing; the control plane
//! coalesces that input into at most one pending message per session. A new
//! enqueue replaces the previous entry wholesale, and the consumer takes the
//! entry exactly once when the agent finishes its turn. Nothing here is
//! persistent — a control-plane restart drops pending input by design.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A queued user message awaiting an idle agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue entry id (fresh UUID per enqueue).
    pub queue_id: String,
    /// Owning session.
    pub session_id: String,
    /// Message text.
    pub content: String,
    /// Opaque attachment descriptors, passed through to the agent.
    pub attachments: Vec<Value>,
    /// Whether the message should run in plan mode.
    pub plan_mode: bool,
    /// When the entry was (last) enqueued.
    pub queued_at: DateTime<Utc>,
    /// User identifier that enqueued it.
    pub queued_by: String,
}

/// Non-destructive queue status for a session.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Whether a message is pending.
    pub queued: bool,
    /// The pending entry, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<QueuedMessage>,
}

/// At-most-one-slot-per-session message holder.
///
/// All mutations go through a single mutex; `take` is therefore exactly-once
/// across concurrent callers, and sessions never observe each other's state.
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: Mutex<HashMap<String, QueuedMessage>>,
}

impl MessageQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new message for `session_id`, replacing any prior entry.
    ///
    /// Returns the stored envelope (with its fresh `queue_id`).
    pub fn queue_message(
        &self,
        session_id: &str,
        content: &str,
        attachments: Vec<Value>,
        plan_mode: bool,
        queued_by: &str,
    ) -> QueuedMessage {
        let entry = QueuedMessage {
            queue_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
            attachments,
            plan_mode,
            queued_at: Utc::now(),
            queued_by: queued_by.to_string(),
        };
        let mut entries = self.entries.lock().expect("message queue lock poisoned");
        if entries.insert(session_id.to_string(), entry.clone()).is_some() {
            log::debug!("[queue] replaced pending message for session {session_id}");
        }
        entry
    }

    /// Atomically remove and return the pending entry for `session_id`.
    ///
    /// Exactly one of any set of concurrent callers observes the entry.
    pub fn take_queued(&self, session_id: &str) -> Option<QueuedMessage> {
        self.entries
            .lock()
            .expect("message queue lock poisoned")
            .remove(session_id)
    }

    /// Remove the pending entry without returning it.
    pub fn cancel_queued(&self, session_id: &str) {
        self.entries
            .lock()
            .expect("message queue lock poisoned")
            .remove(session_id);
    }

    /// Mutate the content of the existing entry (arrow-up edit).
    ///
    /// Returns `false` when the session has nothing queued.
    pub fn update_message(&self, session_id: &str, content: &str) -> bool {
        let mut entries = self.entries.lock().expect("message queue lock poisoned");
        match entries.get_mut(session_id) {
            Some(entry) => {
                entry.content = content.to_string();
                true
            }
            None => false,
        }
    }

    /// Non-destructive status read.
    pub fn get_status(&self, session_id: &str) -> QueueStatus {
        let entries = self.entries.lock().expect("message queue lock poisoned");
        let message = entries.get(session_id).cloned();
        QueueStatus {
            queued: message.is_some(),
            message,
        }
    }
}
