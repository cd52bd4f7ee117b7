//! String-keyed action dispatch for the client WebSocket.
//!
//! Actions map to handler closures in a registry that stays open for
//! extension at startup — deployments register extra actions before serving.
//! Dispatch wraps handler results into response/error envelopes; an action
//! absent from the registry yields `UNKNOWN_ACTION`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::hub::Hub;
use crate::protocol::{ErrorCode, ErrorPayload, MessageType, WsEnvelope};

/// Per-request context handed to handlers.
#[derive(Clone)]
pub struct HandlerCtx {
    /// Connection-scoped client id.
    pub client_id: String,
    /// Broadcast hub (for session joins).
    pub hub: Arc<Hub>,
}

impl std::fmt::Debug for HandlerCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCtx")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Action handler: payload in, payload (or typed error) out.
pub type HandlerFn =
    Arc<dyn Fn(HandlerCtx, Value) -> BoxFuture<'static, Result<Value, ErrorPayload>> + Send + Sync>;

/// Open action registry.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, HandlerFn>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actions", &self.actions().len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `action`.
    pub fn register(&self, action: &str, handler: HandlerFn) {
        self.handlers
            .write()
            .expect("dispatcher lock poisoned")
            .insert(action.to_string(), handler);
    }

    /// Whether `action` has a handler.
    #[must_use]
    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers
            .read()
            .expect("dispatcher lock poisoned")
            .contains_key(action)
    }

    /// All registered action names.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("dispatcher lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Dispatch a request envelope to its handler and wrap the result.
    pub async fn dispatch(&self, ctx: HandlerCtx, request: WsEnvelope) -> WsEnvelope {
        if request.kind != MessageType::Request {
            return WsEnvelope::error_for(
                &request.id,
                &request.action,
                ErrorPayload::new(ErrorCode::BadRequest, "expected a request envelope"),
            );
        }

        let handler = {
            let handlers = self.handlers.read().expect("dispatcher lock poisoned");
            handlers.get(&request.action).cloned()
        };
        let Some(handler) = handler else {
            return WsEnvelope::error_for(
                &request.id,
                &request.action,
                ErrorPayload::new(
                    ErrorCode::UnknownAction,
                    format!("unknown action: {}", request.action),
                ),
            );
        };

        match handler(ctx, request.payload.clone()).await {
            Ok(payload) => WsEnvelope::response_to(&request, payload),
            Err(error) => WsEnvelope::error_for(&request.id, &request.action, error),
        }
    }
}
