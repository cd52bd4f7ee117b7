//! Instance side of the agent stream.
//!
//! One bidirectional WebSocket carries three traffic classes:
//!
//! - **RPC** — the control plane sends `request` envelopes
//!   (`agent.initialize`, `agent.prompt`, …); handlers run in their own task
//!   so a blocking handler never stalls the reader, and the reply is written
//!   under the shared write lock.
//! - **Notifications** — opaque agent events are forwarded as
//!   `agent.event` notifications.
//! - **MCP tunnel** — requests injected by the [`McpBridge`] go out on the
//!   same write lock; `response`/`error` frames arriving here resolve the
//!   bridge's pending table. Late responses are dropped.
//!
//! On disconnect every pending MCP call is failed so tool calls inside the
//! agent error out instead of hanging.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;

use super::process_manager::ProcessManager;
use crate::protocol::{ErrorCode, ErrorPayload, MessageType, WsEnvelope};

type Writer = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// Serve one agent stream connection until it closes.
pub async fn handle(socket: WebSocket, pm: Arc<ProcessManager>) {
    let (sink, mut stream) = socket.split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(sink));

    let mut agent_events = pm.agent().subscribe_events();
    let forward_slot = pm.mcp_forward_rx();
    // Holding the slot for the connection lifetime gives this stream
    // exclusive use of the MCP tunnel; a reconnect picks it up afresh.
    let mut forward_rx = forward_slot.lock().await;

    log::info!("[agent-stream] connected for {}", pm.config().session_id);

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&pm, &writer, text.to_string()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = writer.lock().await.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map_or(1005, |f| u16::from(f.code));
                        if crate::ws::is_normal_close(code) {
                            log::info!("[agent-stream] closed ({code})");
                        } else {
                            log::debug!("[agent-stream] closed abnormally ({code})");
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
            event = agent_events.recv() => {
                match event {
                    Ok(event) => {
                        let note = WsEnvelope::notification("agent.event", event);
                        if send_envelope(&writer, &note).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[agent-stream] lagged, dropped {n} agent event(s)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        // Agent adapter gone; keep serving RPCs.
                    }
                }
            }
            Some(request) = forward_rx.recv() => {
                if send_envelope(&writer, &request).await.is_err() {
                    break;
                }
            }
        }
    }

    // Tool calls in flight observe the disconnect as an error.
    pm.mcp().fail_all();
    log::info!("[agent-stream] disconnected for {}", pm.config().session_id);
}

/// Route one inbound text frame.
async fn handle_frame(pm: &Arc<ProcessManager>, writer: &Writer, text: String) {
    let envelope = match WsEnvelope::parse(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // A malformed frame is logged and skipped; the connection stays.
            log::warn!("[agent-stream] skipping malformed frame: {e}");
            return;
        }
    };

    match envelope.kind {
        MessageType::Request => {
            // Dispatch in its own task so a blocking handler cannot stall
            // the reader.
            let pm = Arc::clone(pm);
            let writer = Arc::clone(writer);
            tokio::spawn(async move {
                let reply = dispatch(&pm, &envelope).await;
                let frame = match reply {
                    Ok(payload) => WsEnvelope::response_to(&envelope, payload),
                    Err(error) => WsEnvelope::error_for(&envelope.id, &envelope.action, error),
                };
                let _ = send_envelope(&writer, &frame).await;
            });
        }
        MessageType::Response | MessageType::Error => {
            if !pm.mcp().resolve(envelope) {
                log::debug!("[agent-stream] dropping spurious or late response");
            }
        }
        MessageType::Notification => {
            // The instance does not consume notifications.
        }
    }
}

/// Dispatch a control-plane RPC by action.
async fn dispatch(pm: &Arc<ProcessManager>, envelope: &WsEnvelope) -> Result<Value, ErrorPayload> {
    let payload = &envelope.payload;
    let result = match envelope.action.as_str() {
        "agent.initialize" => Ok(pm.agent().initialize(payload)),
        "agent.session.new" => pm.agent().session_new(payload).await,
        "agent.session.load" => pm.agent().session_load(payload).await,
        "agent.prompt" => pm.agent().prompt(payload).await,
        "agent.cancel" => pm.agent().cancel().await,
        "agent.stderr" => Ok(pm.agent().stderr_tail()),
        "agent.permissions.respond" => pm.respond_to_permission(payload).await,
        other => {
            return Err(ErrorPayload::new(
                ErrorCode::UnknownAction,
                format!("unknown action: {other}"),
            ));
        }
    };
    result.map_err(map_error)
}

/// Map adapter errors onto the wire taxonomy.
fn map_error(err: anyhow::Error) -> ErrorPayload {
    let message = err.to_string();
    let code = if message.contains("is required") {
        ErrorCode::ValidationError
    } else if message.starts_with("unknown ") {
        ErrorCode::NotFound
    } else {
        ErrorCode::InternalError
    };
    ErrorPayload::new(code, message)
}

async fn send_envelope(writer: &Writer, envelope: &WsEnvelope) -> anyhow::Result<()> {
    writer
        .lock()
        .await
        .send(Message::Text(envelope.to_json().into()))
        .await
        .map_err(|e| anyhow::anyhow!("agent stream write failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_field_maps_to_validation() {
        let err = map_error(anyhow::anyhow!("session_id is required"));
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn unknown_id_maps_to_not_found() {
        let err = map_error(anyhow::anyhow!("unknown pending_id: p-1"));
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("p-1"));
    }

    #[test]
    fn preconditions_map_to_internal_with_message() {
        let err = map_error(anyhow::anyhow!("agent not running"));
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "agent not running");
    }
}
