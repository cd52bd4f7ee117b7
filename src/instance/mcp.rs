//! MCP tunnel bridge over the agent stream.
//!
//! Tool calls made by the agent are marshalled into WebSocket `request`
//! envelopes and injected into the agent stream's outbound write path; the
//! control plane resolves them with `response`/`error` frames matched by id.
//!
//! The bridge owns the pending table. Timeouts are explicit per call; when
//! the control plane disconnects, every pending entry is failed so tool calls
//! inside the agent error out instead of hanging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{MessageType, WsEnvelope};

/// Capacity of the forward channel between tool callers and the stream
/// writer. Tool calls beyond this queue depth block the caller, not the
/// stream.
pub const MCP_FORWARD_CAPACITY: usize = 100;

/// Default per-call timeout when the caller does not specify one.
pub const MCP_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge between in-process tool callers and the agent stream.
pub struct McpBridge {
    forward_tx: mpsc::Sender<WsEnvelope>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<WsEnvelope>>>>,
}

impl std::fmt::Debug for McpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBridge")
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl McpBridge {
    /// Create the bridge and the receiver the agent stream drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<WsEnvelope>) {
        let (forward_tx, forward_rx) = mpsc::channel(MCP_FORWARD_CAPACITY);
        (
            Self {
                forward_tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            forward_rx,
        )
    }

    /// Issue a tunneled request and wait for its response.
    ///
    /// Registration happens before the envelope is handed to the stream
    /// writer, so a fast response can never race the pending entry.
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let envelope = WsEnvelope::request(action, payload);
        let id = envelope.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("mcp pending lock poisoned")
            .insert(id.clone(), tx);

        if self.forward_tx.send(envelope).await.is_err() {
            self.remove(&id);
            bail!("agent stream is not connected");
        }

        let timeout = timeout.unwrap_or(MCP_DEFAULT_TIMEOUT);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.kind {
                MessageType::Error => {
                    let err = response.error_payload();
                    Err(anyhow!("{:?}: {}", err.code, err.message))
                }
                _ => Ok(response.payload),
            },
            Ok(Err(_)) => Err(anyhow!("mcp bridge disconnected while waiting for response")),
            Err(_) => {
                self.remove(&id);
                Err(anyhow!("mcp request timed out after {timeout:?}: {action}"))
            }
        }
    }

    /// Resolve a response/error envelope arriving on the stream.
    ///
    /// Returns `true` when a pending entry consumed it; spurious or late
    /// responses return `false` and are dropped by the caller.
    pub fn resolve(&self, envelope: WsEnvelope) -> bool {
        let tx = self
            .pending
            .lock()
            .expect("mcp pending lock poisoned")
            .remove(&envelope.id);
        match tx {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Fail every pending call; used when the control plane disconnects.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("mcp pending lock poisoned");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            log::warn!("[mcp] failing {} pending tool call(s) on disconnect", drained.len());
        }
        // Dropping the senders wakes every waiter with a recv error.
    }

    /// Number of in-flight tunneled requests.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("mcp pending lock poisoned").len()
    }

    fn remove(&self, id: &str) {
        self.pending
            .lock()
            .expect("mcp pending lock poisoned")
            .remove(id);
    }
}
