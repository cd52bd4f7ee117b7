//! WebSocket message envelope and error payloads.
//!
//! Every frame on the client↔control-plane socket and on both instance
//! streams is a JSON envelope:
//!
//! ```text
//! { "id": "<uuid>", "type": "request|response|error|notification",
//!   "action": "<dotted.action>", "payload": { … }, "metadata": { … }? }
//! ```
//!
//! Requests carry a fresh `id`; the matching response (or error) echoes it.
//! Notifications reuse the same envelope with a server-generated `id` and are
//! never answered. `metadata` is an optional bag for trace context and is
//! passed through untouched.
//!
//! Error payloads are `{ "code": …, "message": …, "details": … }` with the
//! code drawn from [`ErrorCode`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Caller-initiated request; expects exactly one response or error.
    Request,
    /// Successful answer to a request (same `id`).
    Response,
    /// Failed answer to a request (same `id`); payload is an [`ErrorPayload`].
    Error,
    /// Unsolicited server→client event; never answered.
    Notification,
}

/// Machine-readable error category carried in error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request (unparseable JSON, wrong envelope shape).
    BadRequest,
    /// Required field missing or enum value out of range.
    ValidationError,
    /// Unknown session, execution, instance, or pending id.
    NotFound,
    /// Action not present in the dispatcher registry.
    UnknownAction,
    /// Everything else, including precondition failures with a
    /// contract-specified message string.
    InternalError,
}

/// Structured error payload for `type: "error"` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable description; for precondition errors the exact string
    /// is part of the contract.
    pub message: String,
    /// Optional extra context (offending path, id, field name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    /// Build an error payload without details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach a details value.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The JSON envelope carried on every WebSocket in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    /// Correlation id; UUID v4 for requests and notifications.
    pub id: String,
    /// Envelope kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Dotted action name (e.g. `agent.prompt`, `shell.input`).
    pub action: String,
    /// Action-specific payload; `null` when absent.
    #[serde(default)]
    pub payload: Value,
    /// Optional trace context, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WsEnvelope {
    /// Build a request envelope with a fresh UUID id.
    pub fn request(action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageType::Request,
            action: action.into(),
            payload,
            metadata: None,
        }
    }

    /// Build the success response for `req`, echoing id and action.
    pub fn response_to(req: &WsEnvelope, payload: Value) -> Self {
        Self {
            id: req.id.clone(),
            kind: MessageType::Response,
            action: req.action.clone(),
            payload,
            metadata: None,
        }
    }

    /// Build the error response for the request with the given id/action.
    pub fn error_for(id: &str, action: &str, error: ErrorPayload) -> Self {
        Self {
            id: id.to_string(),
            kind: MessageType::Error,
            action: action.to_string(),
            payload: serde_json::to_value(error)
                .unwrap_or_else(|_| Value::String("error serialization failed".into())),
            metadata: None,
        }
    }

    /// Build an unsolicited notification envelope.
    pub fn notification(action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageType::Notification,
            action: action.into(),
            payload,
            metadata: None,
        }
    }

    /// Serialize to a JSON string for a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            // An envelope of plain JSON values cannot fail to serialize; keep
            // the stream alive with a minimal error frame if it ever does.
            log::error!("[protocol] envelope serialization failed: {e}");
            r#"{"id":"","type":"error","action":"","payload":{"code":"INTERNAL_ERROR","message":"serialization failed"}}"#.to_string()
        })
    }

    /// Parse a text frame into an envelope.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).map_err(|e| anyhow::anyhow!("invalid envelope JSON: {e}"))
    }

    /// Decode the payload of an error envelope.
    ///
    /// Falls back to `INTERNAL_ERROR` with the raw payload as the message
    /// when the payload does not parse as an [`ErrorPayload`].
    pub fn error_payload(&self) -> ErrorPayload {
        serde_json::from_value(self.payload.clone()).unwrap_or_else(|_| {
            ErrorPayload::new(ErrorCode::InternalError, self.payload.to_string())
        })
    }
}

/// Messages multiplexed on the workspace stream.
///
/// Outbound (instance → control plane): `shell_output`, `shell_exit`,
/// `git_status`, `git_commit`, `git_reset`, `file_change`, `process_output`,
/// `process_status`, `connected`, `error`, `pong`.
/// Inbound (control plane → instance): `shell_input`, `shell_resize`, `ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceMessage {
    /// Bytes for the PTY (inbound).
    ShellInput {
        /// UTF-8 input data.
        data: String,
    },
    /// Resize the PTY (inbound).
    ShellResize {
        /// New column count.
        cols: u16,
        /// New row count.
        rows: u16,
    },
    /// Keepalive probe (inbound).
    Ping,
    /// PTY output chunk.
    ShellOutput {
        /// UTF-8 lossy output data.
        data: String,
    },
    /// The shell process exited.
    ShellExit {
        /// Exit code; `None` when killed by signal.
        exit_code: Option<i32>,
        /// Whether the session is respawning it.
        respawning: bool,
    },
    /// Git status changed.
    GitStatus {
        /// Full status snapshot.
        status: crate::workspace::GitStatus,
    },
    /// A commit was created through the instance API.
    GitCommit {
        /// New commit id.
        commit_id: String,
        /// Commit message.
        message: String,
    },
    /// The work tree was reset through the instance API.
    GitReset {
        /// Reset target ref.
        target: String,
    },
    /// A file inside the workspace changed.
    FileChange {
        /// Workspace-relative or absolute path.
        path: String,
        /// Change classification.
        kind: crate::workspace::FileChangeKind,
    },
    /// Output from a run-alongside process.
    ProcessOutput {
        /// Runner-assigned process id.
        process_id: String,
        /// UTF-8 lossy output chunk.
        data: String,
    },
    /// Run-alongside process state change.
    ProcessStatus {
        /// Runner-assigned process id.
        process_id: String,
        /// `running`, `exited`, `failed`.
        status: String,
        /// Exit code when exited.
        exit_code: Option<i32>,
    },
    /// Handshake acknowledgment sent once on connect.
    Connected {
        /// Session bound to this stream.
        session_id: String,
    },
    /// Stream-level error report.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// Keepalive reply.
    Pong,
}

impl WorkspaceMessage {
    /// Serialize to a JSON string for a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("[protocol] workspace message serialization failed: {e}");
            r#"{"type":"error","message":"serialization failed"}"#.to_string()
        })
    }

    /// Parse a text frame into a workspace message.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| anyhow::anyhow!("invalid workspace message JSON: {e}"))
    }

    /// Whether this message type is low-volume enough to trace.
    ///
    /// Shell/process output, input, and ping/pong are excluded from tracing.
    #[must_use]
    pub fn is_traced(&self) -> bool {
        matches!(
            self,
            Self::GitStatus { .. }
                | Self::GitCommit { .. }
                | Self::GitReset { .. }
                | Self::FileChange { .. }
                | Self::ProcessStatus { .. }
                | Self::Connected { .. }
                | Self::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let req = WsEnvelope::request("agent.prompt", json!({"text": "hi"}));
        let parsed = WsEnvelope::parse(&req.to_json()).unwrap();
        assert_eq!(parsed.id, req.id);
        assert_eq!(parsed.kind, MessageType::Request);
        assert_eq!(parsed.action, "agent.prompt");
        assert_eq!(parsed.payload["text"], "hi");
        assert!(parsed.metadata.is_none());
    }

    #[test]
    fn response_echoes_id_and_action() {
        let req = WsEnvelope::request("agent.status", json!({}));
        let resp = WsEnvelope::response_to(&req, json!({"status": "ready"}));
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.action, "agent.status");
        assert_eq!(resp.kind, MessageType::Response);
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let err = WsEnvelope::error_for(
            "abc",
            "agent.launch",
            ErrorPayload::new(ErrorCode::ValidationError, "workspace_path is required"),
        );
        let parsed = WsEnvelope::parse(&err.to_json()).unwrap();
        assert_eq!(parsed.kind, MessageType::Error);
        let payload = parsed.error_payload();
        assert_eq!(payload.code, ErrorCode::ValidationError);
        assert_eq!(payload.message, "workspace_path is required");
        assert!(payload.details.is_none());
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let codes = [
            (ErrorCode::BadRequest, "BAD_REQUEST"),
            (ErrorCode::ValidationError, "VALIDATION_ERROR"),
            (ErrorCode::NotFound, "NOT_FOUND"),
            (ErrorCode::UnknownAction, "UNKNOWN_ACTION"),
            (ErrorCode::InternalError, "INTERNAL_ERROR"),
        ];
        for (code, expected) in codes {
            let s = serde_json::to_string(&code).unwrap();
            assert_eq!(s, format!("\"{expected}\""));
        }
    }

    #[test]
    fn message_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageType::Notification).unwrap(),
            "\"notification\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Request).unwrap(),
            "\"request\""
        );
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let parsed = WsEnvelope::parse(
            r#"{"id":"1","type":"request","action":"agent.list"}"#,
        )
        .unwrap();
        assert!(parsed.payload.is_null());
    }

    #[test]
    fn metadata_passes_through() {
        let mut req = WsEnvelope::request("agent.prompt", json!({}));
        req.metadata = Some(json!({"trace_id": "t-1"}));
        let parsed = WsEnvelope::parse(&req.to_json()).unwrap();
        assert_eq!(parsed.metadata.unwrap()["trace_id"], "t-1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(WsEnvelope::parse("not json").is_err());
        assert!(WsEnvelope::parse(r#"{"id":1}"#).is_err());
    }

    #[test]
    fn error_payload_fallback_for_untyped_payload() {
        let env = WsEnvelope {
            id: "x".into(),
            kind: MessageType::Error,
            action: "a".into(),
            payload: json!("plain string"),
            metadata: None,
        };
        let payload = env.error_payload();
        assert_eq!(payload.code, ErrorCode::InternalError);
        assert!(payload.message.contains("plain string"));
    }

    #[test]
    fn details_round_trip() {
        let payload = ErrorPayload::new(ErrorCode::NotFound, "unknown session")
            .with_details(json!({"session_id": "S1"}));
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: ErrorPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.details.unwrap()["session_id"], "S1");
    }

    #[test]
    fn workspace_message_tags_are_snake_case() {
        let msg = WorkspaceMessage::ShellOutput { data: "ls\r\n".into() };
        let json = msg.to_json();
        assert!(json.contains(r#""type":"shell_output""#), "got: {json}");

        let msg = WorkspaceMessage::ShellExit { exit_code: Some(0), respawning: true };
        assert!(msg.to_json().contains(r#""type":"shell_exit""#));

        assert!(WorkspaceMessage::Pong.to_json().contains(r#""type":"pong""#));
    }

    #[test]
    fn workspace_inbound_round_trip() {
        let parsed =
            WorkspaceMessage::parse(r#"{"type":"shell_input","data":"ls\n"}"#).unwrap();
        match parsed {
            WorkspaceMessage::ShellInput { data } => assert_eq!(data, "ls\n"),
            other => panic!("Expected ShellInput, got: {other:?}"),
        }

        let parsed =
            WorkspaceMessage::parse(r#"{"type":"shell_resize","cols":120,"rows":40}"#).unwrap();
        match parsed {
            WorkspaceMessage::ShellResize { cols, rows } => {
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
            other => panic!("Expected ShellResize, got: {other:?}"),
        }

        assert!(matches!(
            WorkspaceMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            WorkspaceMessage::Ping
        ));
    }

    #[test]
    fn workspace_tracing_selectivity() {
        assert!(WorkspaceMessage::Connected { session_id: "S1".into() }.is_traced());
        assert!(WorkspaceMessage::GitReset { target: "HEAD".into() }.is_traced());
        assert!(!WorkspaceMessage::ShellOutput { data: String::new() }.is_traced());
        assert!(!WorkspaceMessage::ShellInput { data: String::new() }.is_traced());
        assert!(!WorkspaceMessage::Ping.is_traced());
        assert!(!WorkspaceMessage::Pong.is_traced());
        assert!(!WorkspaceMessage::ProcessOutput {
            process_id: "p".into(),
            data: String::new()
        }
        .is_traced());
    }

    #[test]
    fn workspace_parse_rejects_unknown_type() {
        assert!(WorkspaceMessage::parse(r#"{"type":"warp_drive"}"#).is_err());
        assert!(WorkspaceMessage::parse("not json").is_err());
    }
}
