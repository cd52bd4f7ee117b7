//! Agent adapter: supervision of the external agent subprocess.
//!
//! The adapter spawns the configured agent command and shuttles line-oriented
//! JSON between it and the agent stream. Event payloads are **opaque**: a
//! stdout line is parsed only far enough to be valid JSON (non-JSON lines are
//! wrapped as `message_chunk`) and republished unmodified. The adapter never
//! inspects event contents — the protocol-specific shape belongs to the
//! agent, not to this process.
//!
//! Stderr is captured into a bounded ring readable through `agent.stderr`.
//! When the subprocess exits, the adapter emits a `complete` event carrying
//! the exit code and flips to not-running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;

use super::McpServerDesc;
use crate::ring::RingBuffer;

/// Capacity of the opaque event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Stderr capture cap (same as the shell replay ring).
const STDERR_CAP: usize = 16 * 1024;

/// Grace period between SIGKILL request and reap on stop.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Mutable agent process state.
#[derive(Debug, Default)]
struct AgentState {
    running: bool,
    pid: Option<u32>,
    agent_session_id: Option<String>,
    exit_code: Option<i32>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Supervisor for the external agent subprocess.
pub struct AgentAdapter {
    argv: Vec<String>,
    env: HashMap<String, String>,
    workdir: PathBuf,
    protocol: String,
    approval_policy: String,
    mcp_servers: Vec<McpServerDesc>,
    events_tx: broadcast::Sender<Value>,
    stderr: Arc<Mutex<RingBuffer>>,
    state: Arc<Mutex<AgentState>>,
    /// Write end of the subprocess stdin; taken while spawned.
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Child handle shared with the waiter task for reaping.
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
}

impl std::fmt::Debug for AgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("agent state lock poisoned");
        f.debug_struct("AgentAdapter")
            .field("argv", &self.argv)
            .field("running", &state.running)
            .field("pid", &state.pid)
            .finish_non_exhaustive()
    }
}

impl AgentAdapter {
    /// Build an adapter; nothing is spawned until a session starts.
    #[must_use]
    pub fn new(
        argv: Vec<String>,
        env: HashMap<String, String>,
        workdir: PathBuf,
        protocol: String,
        approval_policy: String,
        mcp_servers: Vec<McpServerDesc>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            argv,
            env,
            workdir,
            protocol,
            approval_policy,
            mcp_servers,
            events_tx,
            stderr: Arc::new(Mutex::new(RingBuffer::new(STDERR_CAP))),
            state: Arc::new(Mutex::new(AgentState::default())),
            stdin: tokio::sync::Mutex::new(None),
            child: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Subscribe to the opaque agent event flow.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Value> {
        self.events_tx.subscribe()
    }

    /// Handle `agent.initialize`: advertise protocol and capabilities.
    ///
    /// No subprocess is started here; initialization is a capability
    /// handshake.
    #[must_use]
    pub fn initialize(&self, _payload: &Value) -> Value {
        json!({
            "protocol": self.protocol,
            "approval_policy": self.approval_policy,
            "capabilities": {
                "prompt": true,
                "cancel": true,
                "permissions": true,
                "stderr": true,
            },
            "mcp_servers": self.mcp_servers,
        })
    }

    /// Handle `agent.session.new`: spawn the subprocess and mint a session.
    pub async fn session_new(&self, _payload: &Value) -> Result<Value> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.spawn_process(&session_id, false).await?;
        Ok(json!({ "session_id": session_id }))
    }

    /// Handle `agent.session.load`: spawn the subprocess resuming a session.
    pub async fn session_load(&self, payload: &Value) -> Result<Value> {
        let session_id = payload
            .get("session_id")
            .and_then(Value::as_str)
            .context("session_id is required")?
            .to_string();
        self.spawn_process(&session_id, true).await?;
        Ok(json!({ "session_id": session_id }))
    }

    async fn spawn_process(&self, agent_session_id: &str, resume: bool) -> Result<()> {
        if self.argv.is_empty() {
            bail!("agent command is not configured");
        }
        {
            let state = self.state.lock().expect("agent state lock poisoned");
            if state.running {
                bail!("agent already running");
            }
        }

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .current_dir(&self.workdir)
            .envs(&self.env)
            .env("AGENT_SESSION_ID", agent_session_id)
            .env("AGENT_PROTOCOL", &self.protocol)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if resume {
            cmd.env("AGENT_RESUME", "1");
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent: {:?}", self.argv))?;

        let stdin = child.stdin.take().context("agent stdin unavailable")?;
        let stdout = child.stdout.take().context("agent stdout unavailable")?;
        let stderr_pipe = child.stderr.take().context("agent stderr unavailable")?;
        let pid = child.id();

        {
            let mut state = self.state.lock().expect("agent state lock poisoned");
            state.running = true;
            state.pid = pid;
            state.agent_session_id = Some(agent_session_id.to_string());
            state.exit_code = None;
            state.started_at = Some(chrono::Utc::now());
        }
        *self.stdin.lock().await = Some(stdin);

        log::info!(
            "[agent] spawned {:?} (pid {pid:?}) for session {agent_session_id}",
            self.argv
        );

        // Stdout pump: opaque event lines.
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let event = serde_json::from_str::<Value>(&line)
                    .unwrap_or_else(|_| json!({"type": "message_chunk", "content": line}));
                let _ = events_tx.send(event);
            }
        });

        // Stderr pump into the bounded ring.
        let stderr_ring = Arc::clone(&self.stderr);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut ring = stderr_ring.lock().expect("stderr ring lock poisoned");
                ring.push(line.as_bytes());
                ring.push(b"\n");
            }
        });

        // Waiter: propagate the exit code in a `complete` event. The child
        // sits in a shared slot so `stop()` can also reap it.
        *self.child.lock().await = Some(child);
        let events_tx = self.events_tx.clone();
        let state = Arc::clone(&self.state);
        let child_mutex = Arc::clone(&self.child);
        tokio::spawn(async move {
            let code = loop {
                let mut guard = child_mutex.lock().await;
                let wait = guard.as_mut().map(tokio::process::Child::try_wait);
                match wait {
                    Some(Ok(Some(status))) => {
                        guard.take();
                        break status.code();
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        log::warn!("[agent] wait failed: {e}");
                        guard.take();
                        break None;
                    }
                    None => break None, // reaped by stop()
                }
                drop(guard);
                tokio::time::sleep(Duration::from_millis(50)).await;
            };

            {
                let mut state = state.lock().expect("agent state lock poisoned");
                state.running = false;
                state.exit_code = code;
                state.pid = None;
            }
            log::info!("[agent] exited with code {code:?}");
            let _ = events_tx.send(json!({"type": "complete", "exit_code": code}));
        });

        Ok(())
    }

    /// Handle `agent.prompt`: forward the payload to the subprocess.
    pub async fn prompt(&self, payload: &Value) -> Result<Value> {
        self.write_line(&json!({"type": "prompt", "payload": payload}))
            .await?;
        Ok(json!({ "success": true }))
    }

    /// Handle `agent.permissions.respond`: forward the decision.
    pub async fn respond_permission(&self, payload: &Value) -> Result<Value> {
        self.write_line(&json!({"type": "permission_response", "payload": payload}))
            .await?;
        Ok(json!({ "success": true }))
    }

    /// Handle `agent.cancel`: interrupt the in-flight turn.
    pub async fn cancel(&self) -> Result<Value> {
        let pid = {
            let state = self.state.lock().expect("agent state lock poisoned");
            if !state.running {
                bail!("agent not running");
            }
            state.pid
        };
        #[cfg(unix)]
        if let Some(pid) = pid {
            // SAFETY: plain kill(2) with the subprocess pid.
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
            return Ok(json!({ "success": true }));
        }
        let _ = pid;
        bail!("agent not running")
    }

    /// Handle `agent.stderr`: tail of the captured stderr.
    #[must_use]
    pub fn stderr_tail(&self) -> Value {
        let bytes = self
            .stderr
            .lock()
            .expect("stderr ring lock poisoned")
            .to_vec();
        json!({ "stderr": String::from_utf8_lossy(&bytes) })
    }

    /// Status snapshot for the instance HTTP surface.
    #[must_use]
    pub fn status(&self) -> Value {
        let state = self.state.lock().expect("agent state lock poisoned");
        json!({
            "running": state.running,
            "pid": state.pid,
            "agent_session_id": state.agent_session_id,
            "exit_code": state.exit_code,
            "started_at": state.started_at,
            "protocol": self.protocol,
        })
    }

    /// Whether the subprocess is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().expect("agent state lock poisoned").running
    }

    /// Kill the subprocess and reap it.
    pub async fn stop(&self) {
        *self.stdin.lock().await = None;
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(STOP_GRACE, child.wait()).await;
        }
        let mut state = self.state.lock().expect("agent state lock poisoned");
        state.running = false;
        state.pid = None;
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            bail!("agent not running");
        };
        let mut line = serde_json::to_vec(value).context("failed to encode agent line")?;
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            *guard = None;
            bail!("agent stdin write failed: {e}");
        }
        stdin.flush().await.context("agent stdin flush failed")?;
        Ok(())
    }
}
