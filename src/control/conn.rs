//! Client WebSocket connections to the control plane.
//!
//! Each accepted socket registers with the [`Hub`] and gets a writer task
//! draining two sources: hub notifications for the sessions the client has
//! joined, and responses produced by dispatch. The read loop parses
//! envelopes, joins the client to any session named in a request payload,
//! and dispatches each request in its own task.
//!
//! Malformed (unparseable) frames are logged and skipped — the connection
//! survives. JSON that parses but is not a request envelope gets a
//! `BAD_REQUEST` error reply.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::dispatch::{Dispatcher, HandlerCtx};
use crate::hub::Hub;
use crate::protocol::{ErrorCode, ErrorPayload, WsEnvelope};

/// Shared state for the control router.
#[derive(Clone)]
pub struct ControlState {
    /// Action registry.
    pub dispatcher: Arc<Dispatcher>,
    /// Session broadcast hub.
    pub hub: Arc<Hub>,
}

impl std::fmt::Debug for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlState").finish_non_exhaustive()
    }
}

/// Build the control-plane router.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn ws_handler(
    State(state): State<ControlState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

/// Generate a connection-scoped client id.
fn client_id() -> String {
    format!("client:{:08x}", rand::random::<u32>())
}

async fn handle_client(socket: WebSocket, state: ControlState) {
    let client_id = client_id();
    let mut hub_rx = state.hub.register_client(&client_id);
    log::info!("[control] {client_id} connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsEnvelope>(64);

    // Writer task: merge dispatch replies and hub notifications.
    let writer = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                Some(envelope) = out_rx.recv() => envelope,
                Some(envelope) = hub_rx.recv() => envelope,
                else => break,
            };
            if sink
                .send(Message::Text(envelope.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Read loop.
    while let Some(inbound) = stream.next().await {
        match inbound {
            Ok(Message::Text(text)) => {
                handle_text(&state, &client_id, &out_tx, text.to_string()).await;
            }
            Ok(Message::Ping(_)) => {
                // axum answers pings at the protocol layer.
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("[control] {client_id} read error: {e}");
                break;
            }
        }
    }

    state.hub.unregister_client(&client_id);
    writer.abort();
    log::info!("[control] {client_id} disconnected");
}

async fn handle_text(
    state: &ControlState,
    client_id: &str,
    out_tx: &mpsc::Sender<WsEnvelope>,
    text: String,
) {
    // Unparseable JSON: log and skip, never tear the connection down.
    let Ok(raw) = serde_json::from_str::<Value>(&text) else {
        log::warn!("[control] {client_id} sent malformed JSON, skipping");
        return;
    };

    let envelope = match WsEnvelope::parse(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Valid JSON, invalid envelope: the client gets a typed error.
            let id = raw
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let action = raw
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let reply = WsEnvelope::error_for(
                &id,
                &action,
                ErrorPayload::new(ErrorCode::BadRequest, format!("malformed envelope: {e}")),
            );
            let _ = out_tx.send(reply).await;
            return;
        }
    };

    // A request naming a session implies interest in its notifications.
    if let Some(session_id) = envelope.payload.get("session_id").and_then(Value::as_str) {
        state.hub.join(client_id, session_id);
    }

    let ctx = HandlerCtx {
        client_id: client_id.to_string(),
        hub: Arc::clone(&state.hub),
    };
    let dispatcher = Arc::clone(&state.dispatcher);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let reply = dispatcher.dispatch(ctx, envelope).await;
        let _ = out_tx.send(reply).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::ws::{self, WsMessage};
    use std::time::Duration;

    async fn serve_control(dispatcher: Dispatcher) -> (String, Arc<Hub>) {
        let hub = Arc::new(Hub::new());
        let state = ControlState {
            dispatcher: Arc::new(dispatcher),
            hub: Arc::clone(&hub),
        };
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{addr}/ws"), hub)
    }

    async fn recv_envelope(reader: &mut ws::WsReader) -> WsEnvelope {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), reader.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed")
            {
                WsMessage::Text(text) => return WsEnvelope::parse(&text).unwrap(),
                _ => continue,
            }
        }
    }

    fn echo_dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            "agent.list",
            Arc::new(|_ctx, payload| Box::pin(async move { Ok(json!({"echo": payload})) })),
        );
        dispatcher
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_gets_response_with_same_id() {
        let (url, _hub) = serve_control(echo_dispatcher()).await;
        let (mut writer, mut reader) = ws::connect(&url).await.unwrap();

        let request = WsEnvelope::request("agent.list", json!({"q": 7}));
        writer.send_text(&request.to_json()).await.unwrap();

        let reply = recv_envelope(&mut reader).await;
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.payload["echo"]["q"], 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_json_is_skipped_and_connection_survives() {
        let (url, _hub) = serve_control(echo_dispatcher()).await;
        let (mut writer, mut reader) = ws::connect(&url).await.unwrap();

        writer.send_text("this is not json {{{").await.unwrap();

        // A valid request afterwards still works — the connection survived.
        let request = WsEnvelope::request("agent.list", json!({}));
        writer.send_text(&request.to_json()).await.unwrap();
        let reply = recv_envelope(&mut reader).await;
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.kind, MessageType::Response);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_envelope_shape_gets_bad_request() {
        let (url, _hub) = serve_control(echo_dispatcher()).await;
        let (mut writer, mut reader) = ws::connect(&url).await.unwrap();

        writer
            .send_text(r#"{"id": "x-1", "something": "else"}"#)
            .await
            .unwrap();
        let reply = recv_envelope(&mut reader).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.id, "x-1");
        assert_eq!(reply.error_payload().code, ErrorCode::BadRequest);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_action_round_trips_unknown_action() {
        let (url, _hub) = serve_control(echo_dispatcher()).await;
        let (mut writer, mut reader) = ws::connect(&url).await.unwrap();

        let request = WsEnvelope::request("definitely.not.registered", json!({}));
        writer.send_text(&request.to_json()).await.unwrap();
        let reply = recv_envelope(&mut reader).await;
        assert_eq!(reply.error_payload().code, ErrorCode::UnknownAction);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_scoped_request_joins_hub_channel() {
        let (url, hub) = serve_control(echo_dispatcher()).await;
        let (mut writer, mut reader) = ws::connect(&url).await.unwrap();

        // Naming a session joins its channel (the action itself is unknown —
        // the join happens regardless).
        let request = WsEnvelope::request("agent.status", json!({"session_id": "S-42"}));
        writer.send_text(&request.to_json()).await.unwrap();
        let _reply = recv_envelope(&mut reader).await;

        // Broadcasts to that session now reach this client.
        let note = WsEnvelope::notification("agent.event", json!({"type": "reasoning"}));
        let delivered = hub.broadcast_to_session("S-42", &note);
        assert_eq!(delivered, 1);

        let pushed = recv_envelope(&mut reader).await;
        assert_eq!(pushed.kind, MessageType::Notification);
        assert_eq!(pushed.action, "agent.event");
    }
}
