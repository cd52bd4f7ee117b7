//! Session → execution lifecycle.
//!
//! The `LifecycleManager` owns the mapping from sessions to executions and
//! drives the launch/stop protocols end to end: instance creation, health
//! probe, stream attachment, agent handshake, state transitions with event
//! publication, and teardown. It also gates prompt delivery through the
//! per-session [`MessageQueue`] while a turn is in flight.
//!
//! Streams never hold a reference back to this type — notifications flow
//! through the [`EventBus`] and a weak handle, keeping ownership acyclic.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::client::{
    AgentStreamClient, ClientRegistry, SessionClients, WorkspaceCallbacks, WorkspaceStreamClient,
};
use crate::config::Config;
use crate::events::EventBus;
use crate::instance::manager::{InstanceManager, InstanceRequest};
use crate::interactive::InteractiveRunner;
use crate::protocol::{ErrorCode, ErrorPayload};
use crate::queue::MessageQueue;

/// How long `shell.input` waits for the workspace stream handshake.
const STREAM_READY_DEADLINE: Duration = Duration::from_secs(5);
/// Poll cadence while waiting for the handshake.
const STREAM_READY_POLL: Duration = Duration::from_millis(100);
/// Health probe schedule after instance creation.
const HEALTH_ATTEMPTS: u32 = 10;
const HEALTH_DELAY: Duration = Duration::from_millis(100);

/// Execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Instance created, streams attaching.
    Starting,
    /// Streams attached, agent initializing.
    Running,
    /// Agent session established.
    Ready,
    /// Teardown in progress.
    Stopping,
    /// Terminal: torn down.
    Stopped,
    /// Terminal: launch or runtime failure.
    Failed,
}

impl ExecutionStatus {
    /// Whether this status ends the execution.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// One active agent attempt for a session.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    /// Execution id (equals the instance id).
    pub execution_id: String,
    /// Owning session.
    pub session_id: String,
    /// Private instance port.
    pub port: u16,
    /// Workspace the session is bound to.
    pub workspace_path: PathBuf,
    /// Current state.
    pub status: ExecutionStatus,
    /// Agent profile that was launched.
    pub agent_type: String,
    /// Protocol label.
    pub protocol: String,
    /// Launch timestamp.
    pub started_at: DateTime<Utc>,
}

/// Parameters for `agent.launch`.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Task the session belongs to.
    pub task_id: String,
    /// Agent profile to launch.
    pub agent_profile_id: String,
    /// Workspace directory.
    pub workspace_path: PathBuf,
    /// Agent session to resume, when reattaching.
    pub resume_session: Option<String>,
}

/// Owner of sessions and executions.
pub struct LifecycleManager {
    config: Config,
    instances: Arc<InstanceManager>,
    registry: Arc<ClientRegistry>,
    queue: Arc<MessageQueue>,
    bus: EventBus,
    interactive: Arc<dyn InteractiveRunner>,
    /// execution id → execution.
    executions: RwLock<HashMap<String, Execution>>,
    /// session id → non-terminal execution id.
    sessions: RwLock<HashMap<String, String>>,
    /// Sessions with an agent turn in flight.
    busy: Mutex<HashSet<String>>,
    /// Pluggable handler for tunneled MCP requests; swapped in by the tool
    /// host at startup.
    mcp_handler: Arc<RwLock<Option<crate::client::agent_stream::TunnelHandler>>>,
    http: reqwest::Client,
    /// Weak self for callbacks (set right after construction).
    weak_self: RwLock<Weak<LifecycleManager>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("executions", &self.executions.read().map(|m| m.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Build the manager.
    pub fn new(
        config: Config,
        instances: Arc<InstanceManager>,
        registry: Arc<ClientRegistry>,
        queue: Arc<MessageQueue>,
        bus: EventBus,
        interactive: Arc<dyn InteractiveRunner>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            instances,
            registry,
            queue,
            bus,
            interactive,
            executions: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            mcp_handler: Arc::new(RwLock::new(None)),
            http: reqwest::Client::new(),
            weak_self: RwLock::new(Weak::new()),
        });
        *manager.weak_self.write().expect("weak self lock poisoned") = Arc::downgrade(&manager);
        manager
    }

    /// Install the handler for MCP tunnel requests.
    pub fn set_mcp_handler(&self, handler: crate::client::agent_stream::TunnelHandler) {
        *self.mcp_handler.write().expect("mcp handler lock poisoned") = Some(handler);
    }

    /// The message queue (shared with handlers).
    #[must_use]
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// The client registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The auxiliary shell runner.
    #[must_use]
    pub fn interactive_runner(&self) -> &Arc<dyn InteractiveRunner> {
        &self.interactive
    }

    // ── Launch ──────────────────────────────────────────────────────────────

    /// Launch an agent for a fresh session.
    ///
    /// Transitions `starting → running → ready`, publishing an event at each
    /// step. On failure the instance is torn down and the execution is
    /// recorded as `failed`.
    pub async fn launch_agent(&self, req: LaunchRequest) -> Result<Execution> {
        if req.task_id.is_empty() {
            bail!("task_id is required");
        }
        if req.agent_profile_id.is_empty() {
            bail!("agent_profile_id is required");
        }
        if !req.workspace_path.is_dir() {
            bail!(
                "workspace_path is not a directory: {}",
                req.workspace_path.display()
            );
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let agent_argv = self.config.agent_argv().unwrap_or_default();

        // 1. Instance on a private port.
        let (execution_id, port) = self
            .instances
            .create(InstanceRequest {
                instance_id: None,
                session_id: session_id.clone(),
                workspace_path: req.workspace_path.clone(),
                agent_argv,
                workspace_flag: None,
                protocol: self.config.protocol.clone(),
                env: self.config.agent_env.clone(),
                approval_policy: "prompt".to_string(),
                // The launch handshake below drives session creation.
                auto_start: false,
                shell_enabled: self.config.shell_enabled,
                vscode_command: self.config.vscode_command.clone(),
                process_buffer_max_bytes: self.config.process_buffer_max_bytes,
                mcp_servers: Vec::new(),
            })
            .await?;

        let execution = Execution {
            execution_id: execution_id.clone(),
            session_id: session_id.clone(),
            port,
            workspace_path: req.workspace_path.clone(),
            status: ExecutionStatus::Starting,
            agent_type: req.agent_profile_id.clone(),
            protocol: self.config.protocol.clone(),
            started_at: Utc::now(),
        };
        self.executions
            .write()
            .expect("executions lock poisoned")
            .insert(execution_id.clone(), execution.clone());
        self.sessions
            .write()
            .expect("sessions lock poisoned")
            .insert(session_id.clone(), execution_id.clone());
        self.bus.publish(
            &session_id,
            "agent.starting",
            json!({"execution_id": execution_id, "port": port}),
        );

        match self.attach_and_handshake(&execution, req.resume_session).await {
            Ok(()) => {
                self.set_status(&execution_id, ExecutionStatus::Ready);
                self.bus.publish(
                    &session_id,
                    "agent.ready",
                    json!({"execution_id": execution_id}),
                );
                Ok(self
                    .execution(&execution_id)
                    .expect("execution recorded above"))
            }
            Err(e) => {
                log::error!("[lifecycle] launch failed for {session_id}: {e:#}");
                self.registry.remove(&session_id);
                let _ = self.instances.stop(&execution_id).await;
                self.set_status(&execution_id, ExecutionStatus::Failed);
                self.sessions
                    .write()
                    .expect("sessions lock poisoned")
                    .remove(&session_id);
                self.bus.publish(
                    &session_id,
                    "agent.failed",
                    json!({"execution_id": execution_id, "error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    async fn attach_and_handshake(
        &self,
        execution: &Execution,
        resume_session: Option<String>,
    ) -> Result<()> {
        let base_url = format!("http://127.0.0.1:{}", execution.port);
        self.wait_healthy(&base_url).await?;

        let session_id = execution.session_id.clone();

        // Agent stream first: notifications must flow before the agent can
        // produce them.
        let agent = AgentStreamClient::connect(
            &format!("ws://127.0.0.1:{}/api/v1/agent/stream", execution.port),
            self.notification_handler(&session_id),
            self.tunnel_handler(),
        )
        .await
        .context("failed to attach agent stream")?;

        let workspace = WorkspaceStreamClient::connect(
            &format!("ws://127.0.0.1:{}/api/v1/workspace/stream", execution.port),
            self.workspace_callbacks(&session_id),
        )
        .await
        .context("failed to attach workspace stream")?;

        self.registry.register(
            &session_id,
            SessionClients {
                execution_id: execution.execution_id.clone(),
                agent: Arc::clone(&agent),
                workspace,
            },
        );

        self.set_status(&execution.execution_id, ExecutionStatus::Running);
        self.bus.publish(
            &session_id,
            "agent.running",
            json!({"execution_id": execution.execution_id}),
        );

        // Handshake: initialize, then establish the agent session.
        agent
            .send_request("agent.initialize", json!({"client": "agentctl"}), None)
            .await
            .context("agent.initialize failed")?;

        let mcp_servers = self
            .instances
            .get(&execution.execution_id)
            .map(|h| serde_json::to_value(&h.pm.config().mcp_servers).unwrap_or_default())
            .unwrap_or_default();
        let (action, payload) = match resume_session {
            Some(resume) => (
                "agent.session.load",
                json!({"session_id": resume, "mcp_servers": mcp_servers}),
            ),
            None => ("agent.session.new", json!({"mcp_servers": mcp_servers})),
        };
        agent
            .send_request(action, payload, None)
            .await
            .with_context(|| format!("{action} failed"))?;

        Ok(())
    }

    async fn wait_healthy(&self, base_url: &str) -> Result<()> {
        let url = format!("{base_url}/health");
        for attempt in 0..HEALTH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(HEALTH_DELAY).await;
            }
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => log::debug!("[lifecycle] health probe {}: {}", attempt + 1, resp.status()),
                Err(e) => log::debug!("[lifecycle] health probe {}: {e}", attempt + 1),
            }
        }
        bail!("instance did not become healthy: {base_url}")
    }

    /// Notification handler: republish agent events onto the bus and drive
    /// queued-prompt delivery at turn boundaries.
    fn notification_handler(
        &self,
        session_id: &str,
    ) -> crate::client::agent_stream::NotificationHandler {
        let bus = self.bus.clone();
        let session_id = session_id.to_string();
        let weak = self.weak_self.read().expect("weak self lock poisoned").clone();
        Arc::new(move |envelope| {
            bus.publish(&session_id, &envelope.action, envelope.payload.clone());

            let turn_ended = envelope.action == "agent.event"
                && matches!(
                    envelope.payload.get("type").and_then(Value::as_str),
                    Some("complete" | "error")
                );
            if turn_ended {
                if let Some(manager) = weak.upgrade() {
                    let session_id = session_id.clone();
                    tokio::spawn(async move {
                        manager.on_turn_complete(&session_id).await;
                    });
                }
            }
        })
    }

    /// End-of-turn: clear busy and deliver any queued message.
    async fn on_turn_complete(&self, session_id: &str) {
        self.busy
            .lock()
            .expect("busy set lock poisoned")
            .remove(session_id);

        let Some(queued) = self.queue.take_queued(session_id) else {
            return;
        };
        log::info!("[lifecycle] delivering queued message for {session_id}");
        let payload = json!({
            "text": queued.content,
            "attachments": queued.attachments,
            "plan_mode": queued.plan_mode,
        });
        if let Err(e) = self.prompt(session_id, payload).await {
            log::warn!("[lifecycle] queued prompt for {session_id} failed: {e}");
        }
    }

    fn tunnel_handler(&self) -> crate::client::agent_stream::TunnelHandler {
        let slot = Arc::clone(&self.mcp_handler);
        Arc::new(move |envelope| {
            let handler = slot.read().expect("mcp handler lock poisoned").clone();
            match handler {
                Some(handler) => handler(envelope),
                None => Box::pin(async {
                    Err(ErrorPayload::new(
                        ErrorCode::InternalError,
                        "no MCP handler registered",
                    ))
                }),
            }
        })
    }

    /// Workspace callbacks: republish the multiplexed traffic onto the bus.
    fn workspace_callbacks(&self, session_id: &str) -> WorkspaceCallbacks {
        let sid = session_id.to_string();
        let bus = self.bus.clone();
        WorkspaceCallbacks {
            on_shell_output: Some({
                let (bus, sid) = (bus.clone(), sid.clone());
                Arc::new(move |data| bus.publish(&sid, "shell.output", json!({"data": data})))
            }),
            on_shell_exit: Some({
                let (bus, sid) = (bus.clone(), sid.clone());
                Arc::new(move |(code, respawning)| {
                    bus.publish(
                        &sid,
                        "shell.exit",
                        json!({"exit_code": code, "respawning": respawning}),
                    );
                })
            }),
            on_git: Some({
                let (bus, sid) = (bus.clone(), sid.clone());
                Arc::new(move |msg| {
                    bus.publish(
                        &sid,
                        "workspace.git",
                        serde_json::to_value(&msg).unwrap_or_default(),
                    );
                })
            }),
            on_file_change: Some({
                let (bus, sid) = (bus.clone(), sid.clone());
                Arc::new(move |msg| {
                    bus.publish(
                        &sid,
                        "workspace.file_change",
                        serde_json::to_value(&msg).unwrap_or_default(),
                    );
                })
            }),
            on_process: Some({
                let (bus, sid) = (bus.clone(), sid.clone());
                Arc::new(move |msg| {
                    bus.publish(
                        &sid,
                        "workspace.process",
                        serde_json::to_value(&msg).unwrap_or_default(),
                    );
                })
            }),
            on_connected: None,
            on_error: Some({
                let (bus, sid) = (bus.clone(), sid.clone());
                Arc::new(move |message| {
                    bus.publish(&sid, "workspace.error", json!({"message": message}));
                })
            }),
            on_pong: None,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions
            .read()
            .expect("executions lock poisoned")
            .get(execution_id)
            .cloned()
    }

    /// The non-terminal execution for a session, if any.
    #[must_use]
    pub fn get_execution_by_session(&self, session_id: &str) -> Option<Execution> {
        let execution_id = self
            .sessions
            .read()
            .expect("sessions lock poisoned")
            .get(session_id)
            .cloned()?;
        self.execution(&execution_id)
    }

    /// All executions (terminal included), for `agent.list`.
    #[must_use]
    pub fn list_executions(&self) -> Vec<Execution> {
        self.executions
            .read()
            .expect("executions lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn set_status(&self, execution_id: &str, status: ExecutionStatus) {
        let mut executions = self.executions.write().expect("executions lock poisoned");
        if let Some(execution) = executions.get_mut(execution_id) {
            execution.status = status;
        }
    }

    // ── Agent operations ────────────────────────────────────────────────────

    /// Deliver a prompt, or queue it when a turn is in flight.
    ///
    /// Returns `{"success": true}` for a direct send and
    /// `{"queued": true, "queue_id": …}` when coalesced.
    pub async fn prompt(&self, session_id: &str, payload: Value) -> Result<Value> {
        let clients = self
            .registry
            .get(session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;

        let newly_busy = self
            .busy
            .lock()
            .expect("busy set lock poisoned")
            .insert(session_id.to_string());
        if !newly_busy {
            let content = payload
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let attachments = payload
                .get("attachments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let plan_mode = payload
                .get("plan_mode")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let queued_by = payload
                .get("queued_by")
                .and_then(Value::as_str)
                .unwrap_or("user");
            let entry =
                self.queue
                    .queue_message(session_id, content, attachments, plan_mode, queued_by);
            return Ok(json!({"queued": true, "queue_id": entry.queue_id}));
        }

        match clients
            .agent
            .send_request("agent.prompt", payload, None)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                // The turn never started; do not leave the session wedged.
                self.busy
                    .lock()
                    .expect("busy set lock poisoned")
                    .remove(session_id);
                Err(e)
            }
        }
    }

    /// Cancel the in-flight turn.
    pub async fn cancel(&self, session_id: &str) -> Result<Value> {
        let clients = self
            .registry
            .get(session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;
        clients
            .agent
            .send_request("agent.cancel", json!({}), None)
            .await
    }

    /// Agent stderr tail for `agent.logs`.
    pub async fn agent_logs(&self, session_id: &str) -> Result<Value> {
        let clients = self
            .registry
            .get(session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;
        clients
            .agent
            .send_request("agent.stderr", json!({}), None)
            .await
    }

    /// Forward a permission decision.
    pub async fn respond_to_permission(&self, session_id: &str, payload: Value) -> Result<Value> {
        let clients = self
            .registry
            .get(session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;
        clients
            .agent
            .send_request("agent.permissions.respond", payload, None)
            .await
    }

    // ── Shell operations ────────────────────────────────────────────────────

    /// Write shell input, waiting up to five seconds for the workspace
    /// stream handshake to finish.
    ///
    /// The race is real: clients fire `shell.input` the moment `agent.launch`
    /// returns, while the stream attach may still be in flight.
    pub async fn shell_input(&self, session_id: &str, data: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + STREAM_READY_DEADLINE;
        loop {
            if let Some(clients) = self.registry.get(session_id) {
                return clients.workspace.write_shell_input(data).await;
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("workspace stream not ready for session {session_id}");
            }
            tokio::time::sleep(STREAM_READY_POLL).await;
        }
    }

    /// Resize the session shell through the workspace stream.
    pub async fn shell_resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let clients = self
            .registry
            .get(session_id)
            .with_context(|| format!("workspace stream not ready for session {session_id}"))?;
        clients.workspace.resize_shell(cols, rows).await
    }

    /// Shell replay snapshot for `shell.subscribe` catch-up.
    pub async fn shell_snapshot(&self, session_id: &str) -> Result<Value> {
        let execution = self
            .get_execution_by_session(session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;
        let url = format!("http://127.0.0.1:{}/api/v1/shell/buffer", execution.port);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("shell buffer fetch failed")?;
        if !resp.status().is_success() {
            let body: Value = resp.json().await.unwrap_or_default();
            bail!(
                "{}",
                body.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("shell not running")
            );
        }
        resp.json().await.context("shell buffer decode failed")
    }

    // ── Passthrough ─────────────────────────────────────────────────────────

    /// `agent.stdin` passthrough; fails outside passthrough mode.
    pub async fn write_passthrough_stdin(&self, session_id: &str, data: &[u8]) -> Result<()> {
        self.interactive.write_passthrough_stdin(session_id, data).await
    }

    /// `agent.resize` passthrough; fails outside passthrough mode.
    pub async fn resize_passthrough_pty(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        self.interactive
            .resize_passthrough_pty(session_id, cols, rows)
            .await
    }

    // ── Stop ────────────────────────────────────────────────────────────────

    /// Stop the session's execution. Idempotent: stopping an already-stopped
    /// (or unknown) session is a no-op.
    pub async fn stop_agent(&self, session_id: &str) -> Result<()> {
        let execution_id = {
            let sessions = self.sessions.read().expect("sessions lock poisoned");
            sessions.get(session_id).cloned()
        };
        let Some(execution_id) = execution_id else {
            log::debug!("[lifecycle] stop for unknown/stopped session {session_id} is a no-op");
            return Ok(());
        };

        self.set_status(&execution_id, ExecutionStatus::Stopping);
        self.bus.publish(
            session_id,
            "agent.stopping",
            json!({"execution_id": execution_id}),
        );

        // Streams first (grace lives inside the clients), then the instance.
        if let Some(clients) = self.registry.remove(session_id) {
            clients.agent.close().await;
            clients.workspace.close().await;
        }
        if let Err(e) = self.instances.stop(&execution_id).await {
            log::warn!("[lifecycle] instance stop for {execution_id} failed: {e}");
        }

        self.sessions
            .write()
            .expect("sessions lock poisoned")
            .remove(session_id);
        self.busy
            .lock()
            .expect("busy set lock poisoned")
            .remove(session_id);
        self.queue.cancel_queued(session_id);
        self.set_status(&execution_id, ExecutionStatus::Stopped);
        self.bus.publish(
            session_id,
            "agent.stopped",
            json!({"execution_id": execution_id}),
        );
        Ok(())
    }

    /// Stop every live session (control-plane shutdown).
    pub async fn stop_all(&self) {
        let sessions: Vec<String> = self
            .sessions
            .read()
            .expect("sessions lock poisoned")
            .keys()
            .cloned()
            .collect();
        for session_id in sessions {
            if let Err(e) = self.stop_agent(&session_id).await {
                log::warn!("[lifecycle] stop {session_id} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::interactive::ShellRunner;
    use crate::ports::PortAllocator;

    fn build(
        port_base: u16,
        port_max: u16,
        agent_command: &str,
    ) -> (Arc<LifecycleManager>, EventBus) {
        let config = Config {
            instance_port_base: port_base,
            instance_port_max: port_max,
            agent_command: agent_command.to_string(),
            shell_enabled: false,
            ..Config::default()
        };
        let hub = Arc::new(Hub::new());
        let bus = EventBus::new(hub);
        let instances = Arc::new(InstanceManager::new(
            Arc::new(PortAllocator::new(port_base, port_max)),
            Arc::new(crate::instance::http::router),
        ));
        let manager = LifecycleManager::new(
            config,
            instances,
            Arc::new(ClientRegistry::new()),
            Arc::new(MessageQueue::new()),
            bus.clone(),
            Arc::new(ShellRunner::new()),
        );
        (manager, bus)
    }

    fn launch_request(dir: &std::path::Path) -> LaunchRequest {
        LaunchRequest {
            task_id: "T1".into(),
            agent_profile_id: "P1".into(),
            workspace_path: dir.to_path_buf(),
            resume_session: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn launch_prompt_complete_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, bus) = build(21001, 21010, "/bin/cat");
        let mut tap = bus.subscribe();

        let execution = manager.launch_agent(launch_request(dir.path())).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Ready);
        assert!((21001..=21010).contains(&execution.port));
        assert!(!execution.session_id.is_empty());

        // Lifecycle events were published in order.
        let mut seen = Vec::new();
        while let Ok(event) = tap.try_recv() {
            seen.push(event.action);
        }
        assert!(seen.contains(&"agent.starting".to_string()), "got: {seen:?}");
        assert!(seen.contains(&"agent.running".to_string()));
        assert!(seen.contains(&"agent.ready".to_string()));

        // Prompt succeeds immediately; the echoed event arrives on the bus.
        let result = manager
            .prompt(&execution.session_id, json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["success"], true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = tokio::time::timeout(remaining, tap.recv())
                .await
                .expect("timed out waiting for agent event")
                .expect("tap closed");
            if event.action == "agent.event" && event.payload["type"] == "prompt" {
                assert_eq!(event.payload["payload"]["text"], "hi");
                break;
            }
        }

        manager.stop_agent(&execution.session_id).await.unwrap();
        assert!(manager.get_execution_by_session(&execution.session_id).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn busy_session_queues_and_delivers_on_complete() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, bus) = build(21021, 21030, "/bin/cat");
        let mut tap = bus.subscribe();

        let execution = manager.launch_agent(launch_request(dir.path())).await.unwrap();
        let session_id = execution.session_id.clone();

        // First prompt marks the session busy.
        let first = manager.prompt(&session_id, json!({"text": "one"})).await.unwrap();
        assert_eq!(first["success"], true);

        // Second prompt coalesces into the queue.
        let second = manager.prompt(&session_id, json!({"text": "two"})).await.unwrap();
        assert_eq!(second["queued"], true);
        assert!(manager.queue().get_status(&session_id).queued);

        // Third replaces the second.
        let third = manager.prompt(&session_id, json!({"text": "three"})).await.unwrap();
        assert_eq!(third["queued"], true);
        assert_ne!(second["queue_id"], third["queue_id"]);

        // End the turn: cancel kills cat → exit → `complete` → queued
        // message "three" is delivered automatically.
        manager.cancel(&session_id).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut saw_complete = false;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = tokio::time::timeout(remaining, tap.recv())
                .await
                .expect("timed out waiting for completion flow")
                .expect("tap closed");
            if event.action == "agent.event" && event.payload["type"] == "complete" {
                saw_complete = true;
            }
            // Queue drains shortly after complete.
            if saw_complete && !manager.queue().get_status(&session_id).queued {
                break;
            }
        }

        manager.stop_agent(&session_id).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shell_input_race_reports_contract_error() {
        let (manager, _bus) = build(21041, 21042, "/bin/cat");
        let start = tokio::time::Instant::now();
        let err = manager.shell_input("S-ghost", "ls\n").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "workspace stream not ready for session S-ghost"
        );
        // Polled the full five-second window before giving up.
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn port_exhaustion_two_succeed_one_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, _bus) = build(21051, 21052, "/bin/cat");

        let a = manager.launch_agent(launch_request(dir.path()));
        let b = manager.launch_agent(launch_request(dir.path()));
        let c = manager.launch_agent(launch_request(dir.path()));
        let results = tokio::join!(a, b, c);
        let outcomes = [results.0, results.1, results.2];

        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
            .collect();
        assert_eq!(successes, 2, "failures: {failures:?}");
        assert_eq!(failures.len(), 1);
        assert!(
            failures[0].contains("no available ports in range [21051, 21052]"),
            "got: {}",
            failures[0]
        );

        manager.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent_for_unknown_sessions() {
        let (manager, _bus) = build(21061, 21062, "/bin/cat");
        manager.stop_agent("never-launched").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn launch_validation_rejects_bad_requests() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, _bus) = build(21071, 21072, "/bin/cat");

        let mut req = launch_request(dir.path());
        req.task_id = String::new();
        assert!(manager.launch_agent(req).await.is_err());

        let mut req = launch_request(dir.path());
        req.agent_profile_id = String::new();
        assert!(manager.launch_agent(req).await.is_err());

        let mut req = launch_request(dir.path());
        req.workspace_path = PathBuf::from("/definitely/not/a/dir");
        assert!(manager.launch_agent(req).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn passthrough_outside_mode_fails_with_contract_message() {
        let (manager, _bus) = build(21081, 21082, "/bin/cat");
        let err = manager
            .write_passthrough_stdin("S1", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "session not in passthrough mode");
        let err = manager.resize_passthrough_pty("S1", 80, 24).await.unwrap_err();
        assert_eq!(err.to_string(), "session not in passthrough mode");
    }
}
