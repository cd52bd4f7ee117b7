//! Instance HTTP API and WebSocket endpoints.
//!
//! Served on the instance's private port. File and Git handlers operate on
//! the session workspace; the two WebSocket endpoints upgrade into
//! [`super::agent_stream`] and [`super::workspace_stream`]. MCP endpoints
//! (`/sse`, `/message`, `/mcp`) bridge agent-originated tool calls into the
//! tunnel.
//!
//! Errors carry the offending path or id in the body; a Git mutation while
//! another is in flight returns `409 Conflict` (a retriable state, not a
//! failure).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::process_manager::ProcessManager;
use super::{agent_stream, workspace_stream};
use crate::workspace::{git, WorkspaceEvent};

/// Shared state for all instance handlers.
#[derive(Clone)]
pub struct AppState {
    /// Owner of the instance's subordinate processes.
    pub pm: Arc<ProcessManager>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// API error with an HTTP status and a message naming the offender.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, msg.into())
}

fn not_found(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, msg.into())
}

fn conflict(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::CONFLICT, msg.into())
}

fn internal(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, msg.into())
}

/// Build the instance router. This is the handler factory output the
/// manager serves on the bound listener.
pub fn router(pm: Arc<ProcessManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/info", get(info))
        .route("/api/v1/agent/configure", post(agent_configure))
        .route("/api/v1/start", post(agent_start))
        .route("/api/v1/stop", post(agent_stop))
        .route("/api/v1/workspace/tree", get(workspace_tree))
        .route(
            "/api/v1/workspace/file",
            get(file_get)
                .post(file_create)
                .put(file_update)
                .delete(file_delete),
        )
        .route("/api/v1/workspace/search", get(files_search))
        .route("/api/v1/git/status", get(git_status))
        .route("/api/v1/git/commit", post(git_commit))
        .route("/api/v1/git/reset", post(git_reset))
        .route("/api/v1/vscode/start", post(vscode_start))
        .route("/api/v1/vscode/stop", post(vscode_stop))
        .route("/api/v1/vscode/status", get(vscode_status))
        .route("/api/v1/processes", get(processes_list).post(process_start))
        .route("/api/v1/processes/{id}/stop", post(process_stop))
        .route("/api/v1/processes/{id}/output", get(process_output))
        .route("/api/v1/shell/status", get(shell_status))
        .route("/api/v1/shell/buffer", get(shell_buffer))
        .route("/api/v1/agent/stream", get(agent_stream_ws))
        .route("/api/v1/workspace/stream", get(workspace_stream_ws))
        .route("/sse", get(mcp_sse))
        .route("/message", post(mcp_message))
        .route("/mcp", post(mcp_message))
        .with_state(AppState { pm })
}

// ── Health / status ─────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(state.pm.status())
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    let cfg = state.pm.config();
    Json(json!({
        "instance_id": cfg.instance_id,
        "session_id": cfg.session_id,
        "port": cfg.port,
        "protocol": cfg.protocol,
        "workspace": cfg.workdir,
        "shell_enabled": cfg.shell_enabled,
        "auto_start": cfg.auto_start,
        "mcp_servers": cfg.mcp_servers,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Agent control ───────────────────────────────────────────────────────────

async fn agent_configure(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    // Configuration after start is advisory; echo what is in effect.
    log::debug!("[instance] agent configure: {payload}");
    Json(json!({
        "applied": true,
        "effective": state.pm.agent().initialize(&payload),
    }))
}

async fn agent_start(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let result = state
        .pm
        .agent()
        .session_new(&json!({}))
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(result))
}

async fn agent_stop(State(state): State<AppState>) -> Json<Value> {
    state.pm.agent().stop().await;
    Json(json!({ "success": true }))
}

// ── Workspace files ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileBody {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    query: String,
    max_results: Option<usize>,
}

/// Resolve a client path against the workspace, rejecting escapes.
fn resolve(workdir: &Path, rel: &str) -> Result<PathBuf, ApiError> {
    if rel.split(['/', '\\']).any(|part| part == "..") {
        return Err(bad_request(format!("invalid path: {rel}")));
    }
    Ok(workdir.join(rel.trim_start_matches('/')))
}

async fn workspace_tree(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let workdir = state.pm.config().workdir.clone();
    let root = match &query.path {
        Some(rel) => resolve(&workdir, rel)?,
        None => workdir.clone(),
    };
    if !root.is_dir() {
        return Err(not_found(format!("not a directory: {}", root.display())));
    }
    let tree = read_tree(&root, 10).map_err(|e| internal(e.to_string()))?;
    Ok(Json(json!({ "path": root, "entries": tree })))
}

/// Recursive directory listing, `.git` excluded, depth-bounded.
fn read_tree(dir: &Path, depth: usize) -> anyhow::Result<Vec<Value>> {
    let mut entries = Vec::new();
    let mut names: Vec<_> = std::fs::read_dir(dir)?.flatten().collect();
    names.sort_by_key(std::fs::DirEntry::file_name);
    for entry in names {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            let children = if depth > 0 {
                read_tree(&path, depth - 1)?
            } else {
                Vec::new()
            };
            entries.push(json!({
                "name": name,
                "path": path,
                "kind": "directory",
                "children": children,
            }));
        } else {
            entries.push(json!({ "name": name, "path": path, "kind": "file" }));
        }
    }
    Ok(entries)
}

async fn file_get(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let rel = query.path.ok_or_else(|| bad_request("path is required"))?;
    let path = resolve(&state.pm.config().workdir, &rel)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| not_found(format!("cannot read {}: {e}", path.display())))?;
    Ok(Json(json!({ "path": rel, "content": content })))
}

async fn file_create(
    State(state): State<AppState>,
    Json(body): Json<FileBody>,
) -> Result<Json<Value>, ApiError> {
    let path = resolve(&state.pm.config().workdir, &body.path)?;
    if path.exists() {
        return Err(conflict(format!("already exists: {}", body.path)));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| internal(format!("cannot create {}: {e}", body.path)))?;
    }
    std::fs::write(&path, &body.content)
        .map_err(|e| internal(format!("cannot write {}: {e}", body.path)))?;
    Ok(Json(json!({ "path": body.path, "created": true })))
}

async fn file_update(
    State(state): State<AppState>,
    Json(body): Json<FileBody>,
) -> Result<Json<Value>, ApiError> {
    let path = resolve(&state.pm.config().workdir, &body.path)?;
    if !path.exists() {
        return Err(not_found(format!("no such file: {}", body.path)));
    }
    std::fs::write(&path, &body.content)
        .map_err(|e| internal(format!("cannot write {}: {e}", body.path)))?;
    Ok(Json(json!({ "path": body.path, "updated": true })))
}

async fn file_delete(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let rel = query.path.ok_or_else(|| bad_request("path is required"))?;
    let path = resolve(&state.pm.config().workdir, &rel)?;
    if path.is_dir() {
        std::fs::remove_dir_all(&path)
            .map_err(|e| internal(format!("cannot delete {rel}: {e}")))?;
    } else {
        std::fs::remove_file(&path)
            .map_err(|e| not_found(format!("cannot delete {rel}: {e}")))?;
    }
    Ok(Json(json!({ "path": rel, "deleted": true })))
}

/// Cap on per-file bytes scanned by search.
const SEARCH_FILE_CAP: u64 = 1024 * 1024;

async fn files_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.query.is_empty() {
        return Err(bad_request("query is required"));
    }
    let workdir = state.pm.config().workdir.clone();
    let needle = query.query.clone();
    let max = query.max_results.unwrap_or(50);

    let matches = tokio::task::spawn_blocking(move || {
        let mut matches = Vec::new();
        search_dir(&workdir, &workdir, &needle, max, &mut matches);
        matches
    })
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({ "query": query.query, "matches": matches })))
}

fn search_dir(root: &Path, dir: &Path, needle: &str, max: usize, out: &mut Vec<Value>) {
    if out.len() >= max {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= max {
            return;
        }
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == ".git") {
            continue;
        }
        if path.is_dir() {
            search_dir(root, &path, needle, max, out);
        } else if entry.metadata().map(|m| m.len() <= SEARCH_FILE_CAP).unwrap_or(false) {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue; // binary or unreadable
            };
            for (idx, line) in content.lines().enumerate() {
                if line.contains(needle) {
                    let rel = path.strip_prefix(root).unwrap_or(&path);
                    out.push(json!({
                        "path": rel,
                        "line": idx + 1,
                        "text": line,
                    }));
                    if out.len() >= max {
                        return;
                    }
                }
            }
        }
    }
}

// ── Git ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CommitBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResetBody {
    #[serde(default)]
    hard: bool,
    target: Option<String>,
}

async fn git_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let workdir = state.pm.config().workdir.clone();
    let status = tokio::task::spawn_blocking(move || git::status(&workdir))
        .await
        .map_err(|e| internal(e.to_string()))?
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(json!({ "status": status })))
}

async fn git_commit(
    State(state): State<AppState>,
    Json(body): Json<CommitBody>,
) -> Result<Json<Value>, ApiError> {
    let lock = state.pm.git_op_lock();
    let Ok(_guard) = lock.try_lock() else {
        return Err(conflict("another git operation is in progress"));
    };
    let workdir = state.pm.config().workdir.clone();
    let message = body.message.clone();
    let commit_id = tokio::task::spawn_blocking(move || git::commit(&workdir, &message))
        .await
        .map_err(|e| internal(e.to_string()))?
        .map_err(|e| internal(e.to_string()))?;

    state.pm.tracker().publish(WorkspaceEvent::GitCommit {
        commit_id: commit_id.clone(),
        message: body.message,
    });
    Ok(Json(json!({ "commit_id": commit_id })))
}

async fn git_reset(
    State(state): State<AppState>,
    Json(body): Json<ResetBody>,
) -> Result<Json<Value>, ApiError> {
    let lock = state.pm.git_op_lock();
    let Ok(_guard) = lock.try_lock() else {
        return Err(conflict("another git operation is in progress"));
    };
    let workdir = state.pm.config().workdir.clone();
    let target = body.target.clone();
    let hard = body.hard;
    tokio::task::spawn_blocking(move || git::reset(&workdir, hard, target.as_deref()))
        .await
        .map_err(|e| internal(e.to_string()))?
        .map_err(|e| internal(e.to_string()))?;

    let target = body.target.unwrap_or_else(|| "HEAD".to_string());
    state
        .pm
        .tracker()
        .publish(WorkspaceEvent::GitReset { target: target.clone() });
    Ok(Json(json!({ "reset": true, "target": target })))
}

// ── VS Code ─────────────────────────────────────────────────────────────────

async fn vscode_start(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .pm
        .vscode_start()
        .await
        .map(Json)
        .map_err(|e| internal(e.to_string()))
}

async fn vscode_stop(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .pm
        .vscode_stop()
        .await
        .map(Json)
        .map_err(|e| internal(e.to_string()))
}

async fn vscode_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.pm.vscode_status().await)
}

// ── Processes ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProcessBody {
    command: String,
}

async fn processes_list(State(state): State<AppState>) -> Json<Value> {
    let list = state.pm.runner().list().await;
    Json(json!({ "processes": list }))
}

async fn process_start(
    State(state): State<AppState>,
    Json(body): Json<ProcessBody>,
) -> Result<Json<Value>, ApiError> {
    let info = state
        .pm
        .runner()
        .start(&body.command)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

async fn process_stop(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .pm
        .runner()
        .stop(&id)
        .await
        .map_err(|e| not_found(e.to_string()))?;
    Ok(Json(json!({ "process_id": id, "stopped": true })))
}

async fn process_output(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let output = state
        .pm
        .runner()
        .output(&id)
        .await
        .map_err(|e| not_found(e.to_string()))?;
    Ok(Json(json!({ "process_id": id, "output": output })))
}

// ── Shell ───────────────────────────────────────────────────────────────────

async fn shell_status(State(state): State<AppState>) -> Json<Value> {
    match state.pm.shell() {
        Some(shell) => Json(json!({
            "enabled": true,
            "running": shell.is_running(),
            "pid": shell.pid(),
            "started_at": shell.started_at(),
        })),
        None => Json(json!({ "enabled": false, "running": false })),
    }
}

async fn shell_buffer(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let shell = state
        .pm
        .shell()
        .ok_or_else(|| internal("shell not running"))?;
    let bytes = shell.buffered_output();
    Ok(Json(json!({
        "data": String::from_utf8_lossy(&bytes),
        "bytes": bytes.len(),
    })))
}

// ── WebSocket upgrades ──────────────────────────────────────────────────────

async fn agent_stream_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| agent_stream::handle(socket, state.pm))
}

async fn workspace_stream_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| workspace_stream::handle(socket, state.pm))
}

// ── MCP endpoints ───────────────────────────────────────────────────────────

/// SSE bootstrap: announce the message endpoint, then keep the stream open.
async fn mcp_sse() -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>>
{
    let stream = futures_util::stream::once(async {
        Ok(Event::default().event("endpoint").data("/message"))
    })
    .chain(futures_util::stream::pending());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Tunnel an agent-originated MCP message to the control plane.
async fn mcp_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .pm
        .mcp()
        .call("mcp.request", body, None)
        .await
        .map_err(|e| ApiError(StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceConfig;
    use std::collections::HashMap;

    async fn serve(shell: bool) -> (String, Arc<ProcessManager>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = InstanceConfig {
            instance_id: "E1".into(),
            session_id: "S1".into(),
            port: 0,
            protocol: "acp".into(),
            agent_argv: vec!["/bin/cat".into()],
            workdir: dir.path().to_path_buf(),
            env: HashMap::new(),
            approval_policy: "prompt".into(),
            auto_start: false,
            shell_enabled: shell,
            vscode_command: None,
            process_buffer_max_bytes: 4096,
            mcp_servers: Vec::new(),
        };
        let pm = ProcessManager::new(config).unwrap();
        let app = router(Arc::clone(&pm));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), pm, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_and_status_respond() {
        let (base, pm, _dir) = serve(false).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let status: Value = client
            .get(format!("{base}/api/v1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["instance_id"], "E1");
        assert_eq!(status["session_id"], "S1");

        let info: Value = client
            .get(format!("{base}/api/v1/info"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["protocol"], "acp");

        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_crud_round_trip() {
        let (base, pm, _dir) = serve(false).await;
        let client = reqwest::Client::new();

        // Create
        let resp = client
            .post(format!("{base}/api/v1/workspace/file"))
            .json(&json!({"path": "src/lib.rs", "content": "pub fn a() {}"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Duplicate create conflicts
        let resp = client
            .post(format!("{base}/api/v1/workspace/file"))
            .json(&json!({"path": "src/lib.rs", "content": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("src/lib.rs"));

        // Read back
        let body: Value = client
            .get(format!("{base}/api/v1/workspace/file?path=src/lib.rs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["content"], "pub fn a() {}");

        // Update
        let resp = client
            .put(format!("{base}/api/v1/workspace/file"))
            .json(&json!({"path": "src/lib.rs", "content": "pub fn b() {}"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Tree shows it
        let tree: Value = client
            .get(format!("{base}/api/v1/workspace/tree"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let entries = tree["entries"].as_array().unwrap();
        assert!(entries.iter().any(|e| e["name"] == "src"));

        // Search finds the update
        let found: Value = client
            .get(format!("{base}/api/v1/workspace/search?query=fn%20b"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(found["matches"].as_array().unwrap().len(), 1);
        assert_eq!(found["matches"][0]["line"], 1);

        // Delete
        let resp = client
            .delete(format!("{base}/api/v1/workspace/file?path=src/lib.rs"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Read after delete is NOT_FOUND with the path in the error
        let resp = client
            .get(format!("{base}/api/v1/workspace/file?path=src/lib.rs"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn path_escape_is_rejected() {
        let (base, pm, _dir) = serve(false).await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/api/v1/workspace/file?path=../etc/passwd"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("invalid path"));
        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shell_buffer_without_shell_names_precondition() {
        let (base, pm, _dir) = serve(false).await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/api/v1/shell/buffer"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "shell not running");

        let status: Value = client
            .get(format!("{base}/api/v1/shell/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["enabled"], false);
        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn process_endpoints_round_trip() {
        let (base, pm, _dir) = serve(false).await;
        let client = reqwest::Client::new();

        let started: Value = client
            .post(format!("{base}/api/v1/processes"))
            .json(&json!({"command": "echo http_proc_marker"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = started["process_id"].as_str().unwrap().to_string();

        // Output becomes visible once the pump flushes.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let out: Value = client
                .get(format!("{base}/api/v1/processes/{id}/output"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if out["output"].as_str().unwrap().contains("http_proc_marker") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "output never appeared");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let list: Value = client
            .get(format!("{base}/api/v1/processes"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["processes"].as_array().unwrap().len(), 1);

        let resp = client
            .post(format!("{base}/api/v1/processes/{id}/stop"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = client
            .get(format!("{base}/api/v1/processes/nope/output"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn git_endpoints_against_scratch_repo() {
        let (base, pm, dir) = serve(false).await;
        let run = |args: &[&str]| {
            let out = std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?}: {out:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "T"]);
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();

        let client = reqwest::Client::new();
        let status: Value = client
            .get(format!("{base}/api/v1/git/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"]["dirty"], true);

        let commit: Value = client
            .post(format!("{base}/api/v1/git/commit"))
            .json(&json!({"message": "add a.txt"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(commit["commit_id"].as_str().unwrap().len(), 40);

        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        let resp = client
            .post(format!("{base}/api/v1/git/reset"))
            .json(&json!({"hard": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "one"
        );

        pm.stop().await;
    }
}
