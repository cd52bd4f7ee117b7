//! Per-instance process ownership and stop cascade.
//!
//! The `ProcessManager` owns everything that runs inside an instance: the
//! workspace tracker (started first, so auxiliary process output can flow
//! before the agent exists), the PTY shell, the agent adapter, the process
//! runner, and the MCP bridge. `stop()` cascades in reverse dependency
//! order and is idempotent.
//!
//! It also holds the pending permission table: permission requests surfaced
//! by the agent wait here until a client answers through
//! `agent.permissions.respond`, or are abandoned when the session stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::agent::AgentAdapter;
use super::mcp::McpBridge;
use super::runner::ProcessRunner;
use super::InstanceConfig;
use crate::protocol::WsEnvelope;
use crate::shell::{ShellSession, ShellSpec};
use crate::workspace::WorkspaceTracker;

/// A permission request from the agent awaiting a client decision.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionPending {
    /// Pending entry id.
    pub pending_id: String,
    /// Session that owns the request.
    pub session_id: String,
    /// Tool call the request belongs to.
    pub tool_call_id: String,
    /// Human-readable request title.
    pub title: String,
    /// Offered options (opaque to the core).
    pub options: Vec<Value>,
    /// Action classification from the agent.
    pub action_type: String,
    /// When the request arrived.
    pub created_at: DateTime<Utc>,
}

/// Owner of all subordinate processes for one instance.
pub struct ProcessManager {
    config: InstanceConfig,
    tracker: Arc<WorkspaceTracker>,
    shell: Option<Arc<ShellSession>>,
    agent: Arc<AgentAdapter>,
    runner: Arc<ProcessRunner>,
    mcp: Arc<McpBridge>,
    /// Receiver drained by the agent stream; behind a mutex so a
    /// reconnecting stream picks it up again.
    mcp_forward_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WsEnvelope>>>,
    permissions: Mutex<HashMap<String, PermissionPending>>,
    vscode: tokio::sync::Mutex<Option<tokio::process::Child>>,
    /// Serializes git mutations; a busy lock surfaces as HTTP 409.
    git_op_lock: Arc<tokio::sync::Mutex<()>>,
    started_at: DateTime<Utc>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("instance_id", &self.config.instance_id)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    /// Build the manager and start the tracker (and shell, when enabled).
    pub fn new(config: InstanceConfig) -> Result<Arc<Self>> {
        let tracker = WorkspaceTracker::start(&config.workdir)
            .with_context(|| format!("failed to track {}", config.workdir.display()))?;

        let shell = if config.shell_enabled {
            Some(
                ShellSession::spawn(ShellSpec::for_workspace(config.workdir.clone()))
                    .context("failed to start shell session")?,
            )
        } else {
            None
        };

        let agent = Arc::new(AgentAdapter::new(
            config.agent_argv.clone(),
            config.env.clone(),
            config.workdir.clone(),
            config.protocol.clone(),
            config.approval_policy.clone(),
            config.mcp_servers.clone(),
        ));

        let runner = Arc::new(ProcessRunner::new(
            config.workdir.clone(),
            config.process_buffer_max_bytes,
            Arc::clone(&tracker),
        ));

        let (mcp, mcp_forward_rx) = McpBridge::new();

        let pm = Arc::new(Self {
            config,
            tracker,
            shell,
            agent,
            runner,
            mcp: Arc::new(mcp),
            mcp_forward_rx: Arc::new(tokio::sync::Mutex::new(mcp_forward_rx)),
            permissions: Mutex::new(HashMap::new()),
            vscode: tokio::sync::Mutex::new(None),
            git_op_lock: Arc::new(tokio::sync::Mutex::new(())),
            started_at: Utc::now(),
            stopped: AtomicBool::new(false),
        });

        pm.watch_permission_requests();

        // Standalone instances can start an agent session at boot; the
        // control-plane launch path drives session creation itself.
        if pm.config.auto_start && !pm.config.agent_argv.is_empty() {
            let agent = Arc::clone(&pm.agent);
            tokio::spawn(async move {
                if let Err(e) = agent.session_new(&json!({})).await {
                    log::warn!("[instance] auto-start failed: {e}");
                }
            });
        }

        Ok(pm)
    }

    /// Tap the agent event flow for permission requests.
    ///
    /// Permission requests are the one event the manager must register (the
    /// pending table is part of the core contract); their payload is still
    /// passed through to clients untouched.
    fn watch_permission_requests(self: &Arc<Self>) {
        let mut events = self.agent.subscribe_events();
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if event.get("type").and_then(Value::as_str) != Some("permission_request") {
                    continue;
                }
                let Some(pm) = this.upgrade() else { break };
                pm.register_permission(&event);
            }
        });
    }

    fn register_permission(&self, event: &Value) {
        let pending = PermissionPending {
            pending_id: uuid::Uuid::new_v4().to_string(),
            session_id: self.config.session_id.clone(),
            tool_call_id: event
                .get("tool_call_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            title: event
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            options: event
                .get("options")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            action_type: event
                .get("action_type")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string(),
            created_at: Utc::now(),
        };
        log::info!(
            "[instance] permission pending {} for tool call {}",
            pending.pending_id,
            pending.tool_call_id
        );
        self.permissions
            .lock()
            .expect("permission lock poisoned")
            .insert(pending.pending_id.clone(), pending);
    }

    /// Resolve a pending permission and forward the decision to the agent.
    pub async fn respond_to_permission(&self, payload: &Value) -> Result<Value> {
        let pending_id = payload
            .get("pending_id")
            .and_then(Value::as_str)
            .context("pending_id is required")?;
        let pending = self
            .permissions
            .lock()
            .expect("permission lock poisoned")
            .remove(pending_id);
        let Some(pending) = pending else {
            bail!("unknown pending_id: {pending_id}");
        };

        let mut forwarded = payload.clone();
        if let Value::Object(ref mut map) = forwarded {
            map.insert(
                "tool_call_id".to_string(),
                Value::String(pending.tool_call_id.clone()),
            );
        }
        self.agent.respond_permission(&forwarded).await
    }

    /// Currently pending permission requests.
    #[must_use]
    pub fn pending_permissions(&self) -> Vec<PermissionPending> {
        self.permissions
            .lock()
            .expect("permission lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// The instance configuration.
    #[must_use]
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// The workspace tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<WorkspaceTracker> {
        &self.tracker
    }

    /// The PTY shell, when enabled.
    #[must_use]
    pub fn shell(&self) -> Option<&Arc<ShellSession>> {
        self.shell.as_ref()
    }

    /// The agent adapter.
    #[must_use]
    pub fn agent(&self) -> &Arc<AgentAdapter> {
        &self.agent
    }

    /// The run-alongside process runner.
    #[must_use]
    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.runner
    }

    /// The MCP bridge.
    #[must_use]
    pub fn mcp(&self) -> &Arc<McpBridge> {
        &self.mcp
    }

    /// The MCP forward receiver slot (drained by the agent stream).
    #[must_use]
    pub fn mcp_forward_rx(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<WsEnvelope>>> {
        Arc::clone(&self.mcp_forward_rx)
    }

    /// The git operation lock; `try_lock` failure maps to HTTP 409.
    #[must_use]
    pub fn git_op_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.git_op_lock)
    }

    /// Status snapshot for `GET /api/v1/status`.
    #[must_use]
    pub fn status(&self) -> Value {
        json!({
            "instance_id": self.config.instance_id,
            "session_id": self.config.session_id,
            "port": self.config.port,
            "workspace": self.config.workdir,
            "started_at": self.started_at,
            "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
            "shell": {
                "enabled": self.config.shell_enabled,
                "running": self.shell.as_ref().is_some_and(|s| s.is_running()),
                "pid": self.shell.as_ref().and_then(|s| s.pid()),
            },
            "agent": self.agent.status(),
            "pending_permissions": self.pending_permissions().len(),
        })
    }

    /// Launch VS Code for the workspace using the configured command.
    pub async fn vscode_start(&self) -> Result<Value> {
        let command = self
            .config
            .vscode_command
            .as_deref()
            .context("vscode command is not configured")?;
        let mut slot = self.vscode.lock().await;
        if slot.is_some() {
            return Ok(json!({"running": true, "already_running": true}));
        }
        let tokens: Vec<&str> = command.split_whitespace().collect();
        let (program, args) = tokens
            .split_first()
            .context("vscode command is empty")?;
        let child = tokio::process::Command::new(program)
            .args(args)
            .arg(&self.config.workdir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start vscode: {command}"))?;
        log::info!("[instance] vscode started (pid {:?})", child.id());
        *slot = Some(child);
        Ok(json!({"running": true}))
    }

    /// Stop the VS Code process if running.
    pub async fn vscode_stop(&self) -> Result<Value> {
        let mut slot = self.vscode.lock().await;
        if let Some(mut child) = slot.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(json!({"running": false}))
    }

    /// VS Code status including the proxy path when the workspace is known.
    pub async fn vscode_status(&self) -> Value {
        let running = self.vscode.lock().await.is_some();
        let mut status = json!({
            "running": running,
            "configured": self.config.vscode_command.is_some(),
        });
        // The proxy URL is only meaningful when the session workspace is
        // known at response time.
        if let Some(workspace) = self.config.workdir.to_str() {
            status["url"] = Value::String(format!(
                "/vscode/{}/?folder={}",
                self.config.session_id, workspace
            ));
        }
        status
    }

    /// Stop cascade: agent → runners → vscode → shell → tracker.
    ///
    /// Idempotent; pending permissions are abandoned.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[instance] stopping {}", self.config.instance_id);

        self.agent.stop().await;
        self.runner.stop_all().await;
        let _ = self.vscode_stop().await;
        if let Some(shell) = &self.shell {
            shell.stop().await;
        }
        self.tracker.stop();
        self.mcp.fail_all();

        let abandoned = {
            let mut permissions = self.permissions.lock().expect("permission lock poisoned");
            let n = permissions.len();
            permissions.clear();
            n
        };
        if abandoned > 0 {
            log::debug!("[instance] abandoned {abandoned} pending permission(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path, shell: bool) -> InstanceConfig {
        InstanceConfig {
            instance_id: "E1".into(),
            session_id: "S1".into(),
            port: 0,
            protocol: "acp".into(),
            agent_argv: vec!["/bin/cat".into()],
            workdir: dir.to_path_buf(),
            env: StdHashMap::new(),
            approval_policy: "prompt".into(),
            auto_start: false,
            shell_enabled: shell,
            vscode_command: None,
            process_buffer_max_bytes: 4096,
            mcp_servers: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_reflects_components() {
        let dir = tempfile::TempDir::new().unwrap();
        let pm = ProcessManager::new(test_config(dir.path(), true)).unwrap();

        let status = pm.status();
        assert_eq!(status["instance_id"], "E1");
        assert_eq!(status["session_id"], "S1");
        assert_eq!(status["shell"]["enabled"], true);
        assert_eq!(status["agent"]["running"], false);

        pm.stop().await;
        let status = pm.status();
        assert_eq!(status["shell"]["running"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shell_disabled_leaves_slot_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let pm = ProcessManager::new(test_config(dir.path(), false)).unwrap();
        assert!(pm.shell().is_none());
        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let pm = ProcessManager::new(test_config(dir.path(), false)).unwrap();
        pm.stop().await;
        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permission_request_event_registers_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path(), false);
        // Agent prints a permission request then waits.
        config.agent_argv = vec![
            "/bin/sh".into(),
            "-c".into(),
            r#"echo '{"type":"permission_request","tool_call_id":"tc-1","title":"Run ls?","action_type":"execute","options":[{"id":"allow"},{"id":"deny"}]}'; read line"#.into(),
        ];
        let pm = ProcessManager::new(config).unwrap();
        pm.agent().session_new(&json!({})).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let pending = loop {
            let pendings = pm.pending_permissions();
            if let Some(p) = pendings.first() {
                break p.clone();
            }
            assert!(tokio::time::Instant::now() < deadline, "no pending registered");
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        assert_eq!(pending.tool_call_id, "tc-1");
        assert_eq!(pending.title, "Run ls?");
        assert_eq!(pending.action_type, "execute");
        assert_eq!(pending.options.len(), 2);
        assert_eq!(pending.session_id, "S1");

        // Responding consumes the entry and forwards to the agent.
        let result = pm
            .respond_to_permission(&json!({
                "pending_id": pending.pending_id,
                "option_id": "allow",
            }))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert!(pm.pending_permissions().is_empty());

        // Second response with the same id is NOT_FOUND territory.
        let err = pm
            .respond_to_permission(&json!({"pending_id": pending.pending_id}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown pending_id"), "got: {err}");

        pm.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_abandons_pending_permissions() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path(), false);
        config.agent_argv = vec![
            "/bin/sh".into(),
            "-c".into(),
            r#"echo '{"type":"permission_request","tool_call_id":"tc-2"}'; read line"#.into(),
        ];
        let pm = ProcessManager::new(config).unwrap();
        pm.agent().session_new(&json!({})).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pm.pending_permissions().is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        pm.stop().await;
        assert!(pm.pending_permissions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vscode_without_configuration_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let pm = ProcessManager::new(test_config(dir.path(), false)).unwrap();
        assert!(pm.vscode_start().await.is_err());
        let status = pm.vscode_status().await;
        assert_eq!(status["running"], false);
        assert_eq!(status["configured"], false);
        // Proxy URL still derivable — workspace path is known.
        assert!(status["url"].as_str().unwrap().starts_with("/vscode/S1/?folder="));
        pm.stop().await;
    }
}
