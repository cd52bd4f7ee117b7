//! Control-plane side of the agent stream: RPC with pending-request
//! tracking.
//!
//! # Ordering contract
//!
//! `send_request` registers the pending entry **before** writing the frame:
//! a response can arrive the instant the frame hits the socket, and the
//! reader must find the entry. Outbound frames are totally ordered by the
//! write lock; inbound frames by the socket.
//!
//! # Resolution
//!
//! Every `send_request` resolves exactly once: with the response, with a
//! timeout/cancel (the caller's own entry is removed), or with
//! "agent stream disconnected while waiting for response" when the reader
//! dies and drains the table. A response arriving for an id that has already
//! been cancelled is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{ErrorCode, ErrorPayload, MessageType, WsEnvelope};
use crate::ws::{self, WsMessage, WsWriter};

/// Default RPC timeout when the caller does not bound the wait itself.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect retry schedule used during launch.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Typed error for an `error`-kind response, preserving code and message.
#[derive(Debug, Clone)]
pub struct RpcError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable message from the instance.
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Callback for notifications arriving on the stream.
pub type NotificationHandler = Arc<dyn Fn(WsEnvelope) + Send + Sync>;

/// Handler for instance-originated requests (the MCP tunnel).
pub type TunnelHandler =
    Arc<dyn Fn(WsEnvelope) -> BoxFuture<'static, Result<Value, ErrorPayload>> + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<WsEnvelope>>>>;

/// One logical agent-stream connection.
pub struct AgentStreamClient {
    pending: PendingMap,
    writer: Arc<tokio::sync::Mutex<WsWriter>>,
    closed: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for AgentStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStreamClient")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry on drop unless the RPC resolved normally.
///
/// This is what makes caller cancellation (dropped future, timeout) delete
/// exactly its own entry and nothing else.
struct PendingGuard {
    pending: PendingMap,
    id: String,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&self.id);
        }
    }
}

impl AgentStreamClient {
    /// Connect to an instance agent stream with bounded retries.
    pub async fn connect(
        url: &str,
        on_notification: NotificationHandler,
        on_tunnel_request: TunnelHandler,
    ) -> Result<Arc<Self>> {
        let (writer, mut reader) = ws::connect_with_retries(url, CONNECT_ATTEMPTS, CONNECT_DELAY)
            .await?;
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = {
            let pending = Arc::clone(&pending);
            let writer = Arc::clone(&writer);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                loop {
                    match reader.recv().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            route_frame(&pending, &writer, &on_notification, &on_tunnel_request, &text);
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = writer.lock().await.send_pong(data).await;
                        }
                        Some(Ok(WsMessage::Close { code, .. })) => {
                            if ws::is_normal_close(code) {
                                log::info!("[agent-stream] closed by instance ({code})");
                            } else {
                                log::debug!("[agent-stream] abnormal close ({code})");
                            }
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("[agent-stream] read error: {e}");
                            break;
                        }
                        None => break,
                    }
                }

                // Disconnect cleanup: every waiter observes a closed channel.
                closed.store(true, Ordering::SeqCst);
                let drained: Vec<_> = {
                    let mut pending = pending.lock().expect("pending lock poisoned");
                    pending.drain().collect()
                };
                if !drained.is_empty() {
                    log::warn!(
                        "[agent-stream] disconnect resolved {} pending request(s)",
                        drained.len()
                    );
                }
            })
        };

        Ok(Arc::new(Self {
            pending,
            writer,
            closed,
            reader: reader_task,
        }))
    }

    /// Issue an RPC and wait for its response.
    ///
    /// Register first, write second, await third. On timeout the caller's
    /// own pending entry is removed; a late response for it is dropped.
    pub async fn send_request(
        &self,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("agent stream is not connected");
        }

        let envelope = WsEnvelope::request(action, payload);
        let id = envelope.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.clone(), tx);
        let mut guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
            armed: true,
        };

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send_text(&envelope.to_json()).await {
                // Guard removes the entry on return.
                bail!("agent stream write failed: {e}");
            }
        }

        let timeout = timeout.unwrap_or(DEFAULT_RPC_TIMEOUT);
        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(response)) => {
                guard.disarm(); // resolved by the reader, entry already gone
                match response.kind {
                    MessageType::Error => {
                        let err = response.error_payload();
                        Err(RpcError {
                            code: err.code,
                            message: err.message,
                        }
                        .into())
                    }
                    _ => Ok(response.payload),
                }
            }
            Ok(Err(_)) => {
                guard.disarm();
                bail!("agent stream disconnected while waiting for response")
            }
            Err(_) => {
                // Guard removes the entry; the remote side still processes
                // the request, its late response is dropped.
                bail!("agent stream request timed out after {timeout:?}: {action}")
            }
        }
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Whether the underlying socket is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the stream; in-flight RPCs resolve as disconnected.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer.lock().await.send_close().await;
        // The reader task observes the close and drains pending entries.
    }
}

impl Drop for AgentStreamClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route one inbound text frame (runs on the reader task).
fn route_frame(
    pending: &PendingMap,
    writer: &Arc<tokio::sync::Mutex<WsWriter>>,
    on_notification: &NotificationHandler,
    on_tunnel_request: &TunnelHandler,
    text: &str,
) {
    let envelope = match WsEnvelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("[agent-stream] skipping malformed frame: {e}");
            return;
        }
    };

    match envelope.kind {
        MessageType::Response | MessageType::Error => {
            let tx = pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&envelope.id);
            match tx {
                Some(tx) => {
                    // Non-blocking delivery; a cancelled waiter just dropped
                    // its receiver and the response is discarded.
                    let _ = tx.send(envelope);
                }
                None => log::debug!("[agent-stream] dropping late response {}", envelope.id),
            }
        }
        MessageType::Notification => on_notification(envelope),
        MessageType::Request => {
            // MCP tunnel: handle off the reader task, reply on the shared
            // write lock.
            let writer = Arc::clone(writer);
            let handler = Arc::clone(on_tunnel_request);
            tokio::spawn(async move {
                let reply = match handler(envelope.clone()).await {
                    Ok(payload) => WsEnvelope::response_to(&envelope, payload),
                    Err(error) => WsEnvelope::error_for(&envelope.id, &envelope.action, error),
                };
                let _ = writer.lock().await.send_text(&reply.to_json()).await;
            });
        }
    }
}
