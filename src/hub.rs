//! Session-keyed broadcast hub for connected clients.
//!
//! Every client WebSocket connection registers a bounded outbound channel
//! here. Clients join the channels of the sessions they are watching;
//! [`Hub::broadcast_to_session`] fans a notification out to every joined
//! client. A slow client loses frames instead of stalling the broadcaster:
//! sends are `try_send` and a full channel drops that client's copy.
//!
//! Subscription joining/leaving follows the connection lifecycle — a
//! disconnecting client is unregistered once and disappears from every
//! session set it had joined.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::protocol::WsEnvelope;

/// Per-client outbound channel capacity.
///
/// 256 envelopes absorbs bursty agent output while bounding memory per
/// client; overflow drops frames for that client only.
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out broadcaster keyed by session id.
#[derive(Debug, Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    /// client id → outbound channel.
    clients: HashMap<String, mpsc::Sender<WsEnvelope>>,
    /// session id → joined client ids.
    sessions: HashMap<String, HashSet<String>>,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client connection and return the receiving end of its
    /// outbound channel (drained by the connection's writer task).
    pub fn register_client(&self, client_id: &str) -> mpsc::Receiver<WsEnvelope> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.clients.insert(client_id.to_string(), tx);
        log::debug!("[hub] client registered: {client_id}");
        rx
    }

    /// Remove a client and drop it from every session set.
    pub fn unregister_client(&self, client_id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.clients.remove(client_id);
        for members in inner.sessions.values_mut() {
            members.remove(client_id);
        }
        inner.sessions.retain(|_, members| !members.is_empty());
        log::debug!("[hub] client unregistered: {client_id}");
    }

    /// Join `client_id` to the channel for `session_id`.
    ///
    /// Unknown clients are ignored (the connection already closed).
    pub fn join(&self, client_id: &str, session_id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if !inner.clients.contains_key(client_id) {
            return;
        }
        inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    /// Remove `client_id` from the channel for `session_id`.
    pub fn leave(&self, client_id: &str, session_id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(members) = inner.sessions.get_mut(session_id) {
            members.remove(client_id);
            if members.is_empty() {
                inner.sessions.remove(session_id);
            }
        }
    }

    /// Send `msg` to every live client joined to `session_id`.
    ///
    /// Returns the number of clients the message was handed to. Clients with
    /// a full channel are skipped; clients whose receiver is gone are pruned.
    pub fn broadcast_to_session(&self, session_id: &str, msg: &WsEnvelope) -> usize {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let Some(members) = inner.sessions.get(session_id).cloned() else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for client_id in &members {
            match inner.clients.get(client_id) {
                Some(tx) => match tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow consumer: drop this frame for this client only.
                        log::trace!("[hub] dropping frame for slow client {client_id}");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(client_id.clone()),
                },
                None => dead.push(client_id.clone()),
            }
        }

        for client_id in dead {
            inner.clients.remove(&client_id);
            for set in inner.sessions.values_mut() {
                set.remove(&client_id);
            }
        }
        inner.sessions.retain(|_, set| !set.is_empty());

        delivered
    }

    /// Number of clients currently joined to `session_id`.
    #[must_use]
    pub fn session_member_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .sessions
            .get(session_id)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification() -> WsEnvelope {
        WsEnvelope::notification("agent.event", json!({"type": "message_chunk"}))
    }

    #[tokio::test]
    async fn broadcast_reaches_joined_clients_only() {
        let hub = Hub::new();
        let mut rx_a = hub.register_client("a");
        let mut rx_b = hub.register_client("b");
        hub.join("a", "S1");
        hub.join("b", "S2");

        let delivered = hub.broadcast_to_session("S1", &notification());
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_from_all_sessions() {
        let hub = Hub::new();
        let _rx = hub.register_client("a");
        hub.join("a", "S1");
        hub.join("a", "S2");
        hub.unregister_client("a");

        assert_eq!(hub.broadcast_to_session("S1", &notification()), 0);
        assert_eq!(hub.broadcast_to_session("S2", &notification()), 0);
    }

    #[tokio::test]
    async fn join_unknown_client_is_ignored() {
        let hub = Hub::new();
        hub.join("ghost", "S1");
        assert_eq!(hub.session_member_count("S1"), 0);
    }

    #[tokio::test]
    async fn full_channel_drops_frame_without_blocking() {
        let hub = Hub::new();
        let _rx = hub.register_client("slow"); // receiver never drained
        hub.join("slow", "S1");

        // Fill the channel past capacity; broadcast must never block.
        for _ in 0..(CLIENT_CHANNEL_CAPACITY + 10) {
            hub.broadcast_to_session("S1", &notification());
        }
        // The client is still registered — only frames were dropped.
        assert_eq!(hub.session_member_count("S1"), 1);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_broadcast() {
        let hub = Hub::new();
        let rx = hub.register_client("gone");
        hub.join("gone", "S1");
        drop(rx);

        assert_eq!(hub.broadcast_to_session("S1", &notification()), 0);
        assert_eq!(hub.session_member_count("S1"), 0);
    }

    #[tokio::test]
    async fn leave_is_scoped_to_one_session() {
        let hub = Hub::new();
        let mut rx = hub.register_client("a");
        hub.join("a", "S1");
        hub.join("a", "S2");
        hub.leave("a", "S1");

        assert_eq!(hub.broadcast_to_session("S1", &notification()), 0);
        assert_eq!(hub.broadcast_to_session("S2", &notification()), 1);
        assert!(rx.try_recv().is_ok());
    }
}
