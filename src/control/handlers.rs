//! Client-facing action handlers.
//!
//! `register_handlers` installs the authoritative action set onto the
//! [`Dispatcher`]. Agent and shell actions resolve through the
//! [`LifecycleManager`]; workspace file, Git, and VS Code actions proxy to
//! the owning instance's HTTP surface (the control plane keeps no file or
//! Git logic of its own).

use std::sync::Arc;

use serde_json::{json, Value};

use super::dispatch::{Dispatcher, HandlerFn};
use crate::config::Config;
use crate::lifecycle::{LaunchRequest, LifecycleManager};
use crate::protocol::{ErrorCode, ErrorPayload};

/// Map internal errors onto the wire taxonomy.
///
/// Typed RPC errors keep their code; validation and lookup failures are
/// recognized by their contract message shapes; everything else —
/// including precondition strings like "workspace stream not ready …" — is
/// `INTERNAL_ERROR` with the message preserved.
fn map_err(err: &anyhow::Error) -> ErrorPayload {
    if let Some(rpc) = err.downcast_ref::<crate::client::RpcError>() {
        return ErrorPayload::new(rpc.code, rpc.message.clone());
    }
    let message = err.to_string();
    let code = if message.contains("is required") || message.contains("is not a directory") {
        ErrorCode::ValidationError
    } else if message.starts_with("unknown ") {
        ErrorCode::NotFound
    } else {
        ErrorCode::InternalError
    };
    ErrorPayload::new(code, message)
}

fn required_str(payload: &Value, field: &str) -> Result<String, ErrorPayload> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ErrorPayload::new(ErrorCode::ValidationError, format!("{field} is required"))
        })
}

fn required_u16(payload: &Value, field: &str) -> Result<u16, ErrorPayload> {
    payload
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| {
            ErrorPayload::new(ErrorCode::ValidationError, format!("{field} is required"))
        })
}

/// Resolve the instance base URL for a session.
fn instance_base(lm: &LifecycleManager, session_id: &str) -> Result<String, ErrorPayload> {
    lm.get_execution_by_session(session_id)
        .map(|e| format!("http://127.0.0.1:{}", e.port))
        .ok_or_else(|| {
            ErrorPayload::new(
                ErrorCode::NotFound,
                format!("unknown session: {session_id}"),
            )
        })
}

/// Forward an instance HTTP response, mapping status onto the taxonomy.
async fn read_proxied(resp: reqwest::Response) -> Result<Value, ErrorPayload> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or_default();
    if status.is_success() {
        return Ok(body);
    }
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("instance request failed")
        .to_string();
    let code = match status.as_u16() {
        400 => ErrorCode::BadRequest,
        404 => ErrorCode::NotFound,
        _ => ErrorCode::InternalError,
    };
    Err(ErrorPayload::new(code, message))
}

fn proxy_error(e: &reqwest::Error) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::InternalError, format!("instance unreachable: {e}"))
}

/// Install the full client action set.
pub fn register_handlers(dispatcher: &Dispatcher, lifecycle: &Arc<LifecycleManager>, config: &Config) {
    let http = reqwest::Client::new();

    // ── agent.* ─────────────────────────────────────────────────────────────

    register(dispatcher, "agent.list", lifecycle, |lm, _ctx, _payload| async move {
        Ok(json!({ "executions": lm.list_executions() }))
    });

    {
        let lm = Arc::clone(lifecycle);
        let default_workdir = config.workdir.clone();
        let handler: HandlerFn = Arc::new(move |ctx, payload| {
            let lm = Arc::clone(&lm);
            let default_workdir = default_workdir.clone();
            Box::pin(async move {
                let task_id = required_str(&payload, "task_id")?;
                let agent_profile_id = required_str(&payload, "agent_profile_id")?;
                // Launches without a workspace fall back to the configured
                // default directory.
                let workspace_path = match payload.get("workspace_path").and_then(Value::as_str) {
                    Some(path) if !path.is_empty() => std::path::PathBuf::from(path),
                    _ => default_workdir.ok_or_else(|| {
                        ErrorPayload::new(
                            ErrorCode::ValidationError,
                            "workspace_path is required",
                        )
                    })?,
                };
                let resume_session = payload
                    .get("resume_session")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let execution = lm
                    .launch_agent(LaunchRequest {
                        task_id,
                        agent_profile_id,
                        workspace_path,
                        resume_session,
                    })
                    .await
                    .map_err(|e| map_err(&e))?;

                // The launching client follows its session immediately.
                ctx.hub.join(&ctx.client_id, &execution.session_id);
                Ok(json!({
                    "execution_id": execution.execution_id,
                    "session_id": execution.session_id,
                    "port": execution.port,
                    "status": execution.status,
                }))
            })
        });
        dispatcher.register("agent.launch", handler);
    }

    register(dispatcher, "agent.status", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        match lm.get_execution_by_session(&session_id) {
            Some(execution) => Ok(serde_json::to_value(execution).unwrap_or_default()),
            None => Err(ErrorPayload::new(
                ErrorCode::NotFound,
                format!("unknown session: {session_id}"),
            )),
        }
    });

    register(dispatcher, "agent.logs", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        lm.agent_logs(&session_id).await.map_err(|e| map_err(&e))
    });

    register(dispatcher, "agent.stop", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        lm.stop_agent(&session_id).await.map_err(|e| map_err(&e))?;
        Ok(json!({ "success": true }))
    });

    {
        let protocol = config.protocol.clone();
        let handler: HandlerFn = Arc::new(move |_ctx, _payload| {
            let protocol = protocol.clone();
            Box::pin(async move {
                Ok(json!({
                    "types": ["acp", "codex", "rest"],
                    "default": protocol,
                }))
            })
        });
        dispatcher.register("agent.types", handler);
    }

    register(dispatcher, "agent.prompt", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        lm.prompt(&session_id, payload).await.map_err(|e| map_err(&e))
    });

    register(dispatcher, "agent.cancel", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        lm.cancel(&session_id).await.map_err(|e| map_err(&e))
    });

    register(
        dispatcher,
        "agent.permissions.respond",
        lifecycle,
        |lm, _ctx, payload| async move {
            let session_id = required_str(&payload, "session_id")?;
            lm.respond_to_permission(&session_id, payload)
                .await
                .map_err(|e| map_err(&e))
        },
    );

    // ── Passthrough ─────────────────────────────────────────────────────────

    register(dispatcher, "agent.stdin", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let data = required_str(&payload, "data")?;
        lm.write_passthrough_stdin(&session_id, data.as_bytes())
            .await
            .map_err(|e| map_err(&e))?;
        Ok(json!({ "success": true }))
    });

    register(dispatcher, "agent.resize", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let cols = required_u16(&payload, "cols")?;
        let rows = required_u16(&payload, "rows")?;
        lm.resize_passthrough_pty(&session_id, cols, rows)
            .await
            .map_err(|e| map_err(&e))?;
        Ok(json!({ "success": true }))
    });

    // ── shell.* ─────────────────────────────────────────────────────────────

    {
        let lm = Arc::clone(lifecycle);
        let client = http.clone();
        let handler: HandlerFn = Arc::new(move |_ctx, payload| {
            let lm = Arc::clone(&lm);
            let client = client.clone();
            Box::pin(async move {
                let session_id = required_str(&payload, "session_id")?;
                let base = instance_base(&lm, &session_id)?;
                let resp = client
                    .get(format!("{base}/api/v1/shell/status"))
                    .send()
                    .await
                    .map_err(|e| proxy_error(&e))?;
                read_proxied(resp).await
            })
        });
        dispatcher.register("shell.status", handler);
    }

    {
        let lm = Arc::clone(lifecycle);
        let handler: HandlerFn = Arc::new(move |ctx, payload| {
            let lm = Arc::clone(&lm);
            Box::pin(async move {
                let session_id = required_str(&payload, "session_id")?;
                // Joining first: live frames start flowing right after the
                // snapshot is taken, and duplicates are limited to what the
                // snapshot already contains.
                ctx.hub.join(&ctx.client_id, &session_id);
                let snapshot = lm
                    .shell_snapshot(&session_id)
                    .await
                    .map_err(|e| map_err(&e))?;
                Ok(json!({
                    "subscribed": true,
                    "data": snapshot.get("data").cloned().unwrap_or_default(),
                }))
            })
        });
        dispatcher.register("shell.subscribe", handler);
    }

    register(dispatcher, "shell.input", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let data = required_str(&payload, "data")?;
        lm.shell_input(&session_id, &data)
            .await
            .map_err(|e| map_err(&e))?;
        Ok(json!({ "success": true }))
    });

    register(dispatcher, "shell.resize", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let cols = required_u16(&payload, "cols")?;
        let rows = required_u16(&payload, "rows")?;
        lm.shell_resize(&session_id, cols, rows)
            .await
            .map_err(|e| map_err(&e))?;
        Ok(json!({ "success": true }))
    });

    // ── user_shell.* ────────────────────────────────────────────────────────

    register(dispatcher, "user_shell.list", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let shells = lm
            .interactive_runner()
            .list_user_shells(&session_id)
            .await
            .map_err(|e| map_err(&e))?;
        Ok(json!({ "shells": shells }))
    });

    register(dispatcher, "user_shell.create", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        // Auxiliary shells live in the same workspace as the agent.
        let execution = lm.get_execution_by_session(&session_id).ok_or_else(|| {
            ErrorPayload::new(
                ErrorCode::NotFound,
                format!("unknown session: {session_id}"),
            )
        })?;
        let info = lm
            .interactive_runner()
            .create_user_shell(&session_id, &execution.workspace_path)
            .await
            .map_err(|e| map_err(&e))?;
        Ok(serde_json::to_value(info).unwrap_or_default())
    });

    register(dispatcher, "user_shell.stop", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let shell_id = required_str(&payload, "shell_id")?;
        lm.interactive_runner()
            .stop_user_shell(&session_id, &shell_id)
            .await
            .map_err(|e| map_err(&e))?;
        Ok(json!({ "success": true }))
    });

    // ── workspace.* (proxied to the instance) ───────────────────────────────

    proxy_get_action(dispatcher, lifecycle, &http, "workspace.tree.get", |payload| {
        let mut query = Vec::new();
        if let Some(path) = payload.get("path").and_then(Value::as_str) {
            query.push(("path".to_string(), path.to_string()));
        }
        ("/api/v1/workspace/tree".to_string(), query)
    });

    proxy_get_action(
        dispatcher,
        lifecycle,
        &http,
        "workspace.file.content.get",
        |payload| {
            let path = payload
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (
                "/api/v1/workspace/file".to_string(),
                vec![("path".to_string(), path)],
            )
        },
    );

    {
        let lm = Arc::clone(lifecycle);
        let client = http.clone();
        let handler: HandlerFn = Arc::new(move |_ctx, payload| {
            let lm = Arc::clone(&lm);
            let client = client.clone();
            Box::pin(async move {
                let session_id = required_str(&payload, "session_id")?;
                let path = required_str(&payload, "path")?;
                let content = payload
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let base = instance_base(&lm, &session_id)?;
                let resp = client
                    .put(format!("{base}/api/v1/workspace/file"))
                    .json(&json!({"path": path, "content": content}))
                    .send()
                    .await
                    .map_err(|e| proxy_error(&e))?;
                read_proxied(resp).await
            })
        });
        dispatcher.register("workspace.file.content.update", handler);
    }

    {
        let lm = Arc::clone(lifecycle);
        let client = http.clone();
        let handler: HandlerFn = Arc::new(move |_ctx, payload| {
            let lm = Arc::clone(&lm);
            let client = client.clone();
            Box::pin(async move {
                let session_id = required_str(&payload, "session_id")?;
                let path = required_str(&payload, "path")?;
                let content = payload
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let base = instance_base(&lm, &session_id)?;
                let resp = client
                    .post(format!("{base}/api/v1/workspace/file"))
                    .json(&json!({"path": path, "content": content}))
                    .send()
                    .await
                    .map_err(|e| proxy_error(&e))?;
                read_proxied(resp).await
            })
        });
        dispatcher.register("workspace.file.create", handler);
    }

    {
        let lm = Arc::clone(lifecycle);
        let client = http.clone();
        let handler: HandlerFn = Arc::new(move |_ctx, payload| {
            let lm = Arc::clone(&lm);
            let client = client.clone();
            Box::pin(async move {
                let session_id = required_str(&payload, "session_id")?;
                let path = required_str(&payload, "path")?;
                let base = instance_base(&lm, &session_id)?;
                let resp = client
                    .delete(format!("{base}/api/v1/workspace/file"))
                    .query(&[("path", path.as_str())])
                    .send()
                    .await
                    .map_err(|e| proxy_error(&e))?;
                read_proxied(resp).await
            })
        });
        dispatcher.register("workspace.file.delete", handler);
    }

    proxy_get_action(dispatcher, lifecycle, &http, "workspace.files.search", |payload| {
        let mut query = vec![(
            "query".to_string(),
            payload
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )];
        if let Some(max) = payload.get("max_results").and_then(Value::as_u64) {
            query.push(("max_results".to_string(), max.to_string()));
        }
        ("/api/v1/workspace/search".to_string(), query)
    });

    // ── vscode.* (proxied) ──────────────────────────────────────────────────

    proxy_post_action(dispatcher, lifecycle, &http, "vscode.start", "/api/v1/vscode/start");
    proxy_post_action(dispatcher, lifecycle, &http, "vscode.stop", "/api/v1/vscode/stop");
    proxy_get_action(dispatcher, lifecycle, &http, "vscode.status", |_payload| {
        ("/api/v1/vscode/status".to_string(), Vec::new())
    });

    {
        let lm = Arc::clone(lifecycle);
        let client = http.clone();
        let handler: HandlerFn = Arc::new(move |_ctx, payload| {
            let lm = Arc::clone(&lm);
            let client = client.clone();
            Box::pin(async move {
                let session_id = required_str(&payload, "session_id")?;
                let path = required_str(&payload, "path")?;
                let base = instance_base(&lm, &session_id)?;
                let resp = client
                    .get(format!("{base}/api/v1/vscode/status"))
                    .send()
                    .await
                    .map_err(|e| proxy_error(&e))?;
                let mut status = read_proxied(resp).await?;
                if let Some(url) = status.get("url").and_then(Value::as_str) {
                    let open_url = format!("{url}&file={path}");
                    lm.registry().cache_proxy(&session_id, &open_url);
                    status["url"] = Value::String(open_url);
                }
                Ok(status)
            })
        });
        dispatcher.register("vscode.openFile", handler);
    }

    // ── queue.* ─────────────────────────────────────────────────────────────

    register(dispatcher, "queue.status", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        Ok(serde_json::to_value(lm.queue().get_status(&session_id)).unwrap_or_default())
    });

    register(dispatcher, "queue.cancel", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        lm.queue().cancel_queued(&session_id);
        Ok(json!({ "success": true }))
    });

    register(dispatcher, "queue.update", lifecycle, |lm, _ctx, payload| async move {
        let session_id = required_str(&payload, "session_id")?;
        let content = required_str(&payload, "content")?;
        let updated = lm.queue().update_message(&session_id, &content);
        if updated {
            Ok(json!({ "success": true }))
        } else {
            Err(ErrorPayload::new(
                ErrorCode::NotFound,
                format!("no queued message for session {session_id}"),
            ))
        }
    });
}

/// Register a simple lifecycle-backed handler.
fn register<F, Fut>(
    dispatcher: &Dispatcher,
    action: &str,
    lifecycle: &Arc<LifecycleManager>,
    f: F,
) where
    F: Fn(Arc<LifecycleManager>, super::dispatch::HandlerCtx, Value) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: std::future::Future<Output = Result<Value, ErrorPayload>> + Send + 'static,
{
    let lm = Arc::clone(lifecycle);
    let f = Arc::new(f);
    let handler: HandlerFn = Arc::new(move |ctx, payload| {
        let lm = Arc::clone(&lm);
        let f = Arc::clone(&f);
        Box::pin(async move { f(lm, ctx, payload).await })
    });
    dispatcher.register(action, handler);
}

/// Register a GET proxy to the instance HTTP surface.
fn proxy_get_action<F>(
    dispatcher: &Dispatcher,
    lifecycle: &Arc<LifecycleManager>,
    http: &reqwest::Client,
    action: &str,
    to_request: F,
) where
    F: Fn(&Value) -> (String, Vec<(String, String)>) + Send + Sync + 'static,
{
    let lm = Arc::clone(lifecycle);
    let client = http.clone();
    let handler: HandlerFn = Arc::new(move |_ctx, payload| {
        let lm = Arc::clone(&lm);
        let client = client.clone();
        let (path, query) = to_request(&payload);
        Box::pin(async move {
            let session_id = required_str(&payload, "session_id")?;
            let base = instance_base(&lm, &session_id)?;
            let resp = client
                .get(format!("{base}{path}"))
                .query(&query)
                .send()
                .await
                .map_err(|e| proxy_error(&e))?;
            read_proxied(resp).await
        })
    });
    dispatcher.register(action, handler);
}

/// Register a bodyless POST proxy to the instance HTTP surface.
fn proxy_post_action(
    dispatcher: &Dispatcher,
    lifecycle: &Arc<LifecycleManager>,
    http: &reqwest::Client,
    action: &str,
    path: &str,
) {
    let lm = Arc::clone(lifecycle);
    let client = http.clone();
    let path = path.to_string();
    let handler: HandlerFn = Arc::new(move |_ctx, payload| {
        let lm = Arc::clone(&lm);
        let client = client.clone();
        let path = path.clone();
        Box::pin(async move {
            let session_id = required_str(&payload, "session_id")?;
            let base = instance_base(&lm, &session_id)?;
            let resp = client
                .post(format!("{base}{path}"))
                .json(&json!({}))
                .send()
                .await
                .map_err(|e| proxy_error(&e))?;
            read_proxied(resp).await
        })
    });
    dispatcher.register(action, handler);
}

/// The authoritative client action set; every name here must have a handler
/// after [`register_handlers`].
pub const CLIENT_ACTIONS: &[&str] = &[
    "agent.list",
    "agent.launch",
    "agent.status",
    "agent.logs",
    "agent.stop",
    "agent.types",
    "agent.prompt",
    "agent.cancel",
    "agent.permissions.respond",
    "agent.stdin",
    "agent.resize",
    "shell.status",
    "shell.subscribe",
    "shell.input",
    "shell.resize",
    "user_shell.list",
    "user_shell.create",
    "user_shell.stop",
    "workspace.tree.get",
    "workspace.file.content.get",
    "workspace.file.content.update",
    "workspace.file.create",
    "workspace.file.delete",
    "workspace.files.search",
    "vscode.start",
    "vscode.stop",
    "vscode.status",
    "vscode.openFile",
    "queue.status",
    "queue.cancel",
    "queue.update",
];
