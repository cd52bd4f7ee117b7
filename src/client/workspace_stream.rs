//! Control-plane side of the workspace stream.
//!
//! A writer task owns the socket sink and drains an input channel; the
//! reader task parses [`WorkspaceMessage`]s and routes them through
//! [`dispatch_workspace_message`] into three callback subgroups (shell, git,
//! process). Missing callbacks are skipped silently — handlers register only
//! what they consume.
//!
//! After `close()`, `write_shell_input`, `resize_shell`, and `ping` fail
//! promptly with `workspace stream closed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::protocol::WorkspaceMessage;
use crate::ws::{self, WsMessage};

/// Connect retry schedule used during launch.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Outbound queue depth (control messages are tiny).
const OUT_CHANNEL_CAPACITY: usize = 64;

type Callback<T> = Option<Arc<dyn Fn(T) + Send + Sync>>;

/// Callback set for inbound workspace traffic.
///
/// Grouped the way handlers consume it: shell frames, git events, process
/// events, plus connection-level signals.
#[derive(Default, Clone)]
pub struct WorkspaceCallbacks {
    /// PTY output chunks.
    pub on_shell_output: Callback<String>,
    /// Shell exit notices `(exit_code, respawning)`.
    pub on_shell_exit: Callback<(Option<i32>, bool)>,
    /// Git subgroup: `git_status`, `git_commit`, `git_reset`.
    pub on_git: Callback<WorkspaceMessage>,
    /// File change notices `(path, kind as string)`.
    pub on_file_change: Callback<WorkspaceMessage>,
    /// Process subgroup: `process_output`, `process_status`.
    pub on_process: Callback<WorkspaceMessage>,
    /// Handshake acknowledgment.
    pub on_connected: Callback<String>,
    /// Stream-level errors.
    pub on_error: Callback<String>,
    /// Keepalive replies.
    pub on_pong: Callback<()>,
}

impl std::fmt::Debug for WorkspaceCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCallbacks").finish_non_exhaustive()
    }
}

/// Route one inbound message to its subgroup callback.
///
/// Inbound-only types (`shell_input`, `shell_resize`, `ping`) are never
/// produced by the instance and are ignored here.
pub fn dispatch_workspace_message(msg: WorkspaceMessage, callbacks: &WorkspaceCallbacks) {
    if msg.is_traced() {
        log::debug!("[workspace-stream] inbound: {}", msg.to_json());
    }
    match msg {
        WorkspaceMessage::ShellOutput { data } => {
            if let Some(cb) = &callbacks.on_shell_output {
                cb(data);
            }
        }
        WorkspaceMessage::ShellExit {
            exit_code,
            respawning,
        } => {
            if let Some(cb) = &callbacks.on_shell_exit {
                cb((exit_code, respawning));
            }
        }
        msg @ (WorkspaceMessage::GitStatus { .. }
        | WorkspaceMessage::GitCommit { .. }
        | WorkspaceMessage::GitReset { .. }) => {
            if let Some(cb) = &callbacks.on_git {
                cb(msg);
            }
        }
        msg @ WorkspaceMessage::FileChange { .. } => {
            if let Some(cb) = &callbacks.on_file_change {
                cb(msg);
            }
        }
        msg @ (WorkspaceMessage::ProcessOutput { .. }
        | WorkspaceMessage::ProcessStatus { .. }) => {
            if let Some(cb) = &callbacks.on_process {
                cb(msg);
            }
        }
        WorkspaceMessage::Connected { session_id } => {
            if let Some(cb) = &callbacks.on_connected {
                cb(session_id);
            }
        }
        WorkspaceMessage::Error { message } => {
            if let Some(cb) = &callbacks.on_error {
                cb(message);
            }
        }
        WorkspaceMessage::Pong => {
            if let Some(cb) = &callbacks.on_pong {
                cb(());
            }
        }
        WorkspaceMessage::ShellInput { .. }
        | WorkspaceMessage::ShellResize { .. }
        | WorkspaceMessage::Ping => {}
    }
}

enum Outbound {
    Msg(WorkspaceMessage),
    WsPong(Vec<u8>),
    Close,
}

/// One logical workspace-stream connection.
pub struct WorkspaceStreamClient {
    out_tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for WorkspaceStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceStreamClient")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WorkspaceStreamClient {
    /// Connect to an instance workspace stream with bounded retries.
    pub async fn connect(url: &str, callbacks: WorkspaceCallbacks) -> Result<Arc<Self>> {
        let (mut writer, mut reader) =
            ws::connect_with_retries(url, CONNECT_ATTEMPTS, CONNECT_DELAY).await?;
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        // Writer task: sole owner of the sink.
        {
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(item) = out_rx.recv().await {
                    let result = match item {
                        Outbound::Msg(msg) => writer.send_text(&msg.to_json()).await,
                        Outbound::WsPong(data) => writer.send_pong(data).await,
                        Outbound::Close => {
                            let _ = writer.send_close().await;
                            break;
                        }
                    };
                    if result.is_err() {
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            });
        }

        // Reader task: parse and dispatch.
        {
            let out_tx = out_tx.clone();
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                loop {
                    match reader.recv().await {
                        Some(Ok(WsMessage::Text(text))) => match WorkspaceMessage::parse(&text) {
                            Ok(msg) => dispatch_workspace_message(msg, &callbacks),
                            Err(e) => {
                                log::warn!("[workspace-stream] skipping malformed frame: {e}");
                            }
                        },
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = out_tx.try_send(Outbound::WsPong(data));
                        }
                        Some(Ok(WsMessage::Close { code, .. })) => {
                            if ws::is_normal_close(code) {
                                log::info!("[workspace-stream] closed by instance ({code})");
                            } else {
                                log::debug!("[workspace-stream] abnormal close ({code})");
                            }
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("[workspace-stream] read error: {e}");
                            break;
                        }
                        None => break,
                    }
                }
                closed.store(true, Ordering::SeqCst);
            });
        }

        Ok(Arc::new(Self { out_tx, closed }))
    }

    /// Send shell input bytes.
    pub async fn write_shell_input(&self, data: &str) -> Result<()> {
        self.send(WorkspaceMessage::ShellInput {
            data: data.to_string(),
        })
        .await
    }

    /// Resize the remote PTY.
    pub async fn resize_shell(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(WorkspaceMessage::ShellResize { cols, rows }).await
    }

    /// Keepalive probe; the instance answers `pong`.
    pub async fn ping(&self) -> Result<()> {
        self.send(WorkspaceMessage::Ping).await
    }

    async fn send(&self, msg: WorkspaceMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("workspace stream closed");
        }
        if self.out_tx.send(Outbound::Msg(msg)).await.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            bail!("workspace stream closed");
        }
        Ok(())
    }

    /// Whether the stream is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the stream; subsequent writes fail promptly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out_tx.send(Outbound::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{GitFileStatus, GitStatus};
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, WorkspaceCallbacks) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = WorkspaceCallbacks {
            on_shell_output: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |data| seen.lock().unwrap().push(format!("shell:{data}")))
            }),
            on_shell_exit: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |(code, respawning)| {
                    seen.lock()
                        .unwrap()
                        .push(format!("exit:{code:?}:{respawning}"))
                })
            }),
            on_git: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |msg| {
                    seen.lock().unwrap().push(format!("git:{}", msg.to_json()));
                })
            }),
            on_file_change: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |msg| {
                    seen.lock().unwrap().push(format!("file:{}", msg.to_json()));
                })
            }),
            on_process: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |msg| {
                    seen.lock().unwrap().push(format!("proc:{}", msg.to_json()));
                })
            }),
            on_connected: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |sid| seen.lock().unwrap().push(format!("connected:{sid}")))
            }),
            on_error: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |msg| seen.lock().unwrap().push(format!("error:{msg}")))
            }),
            on_pong: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |()| seen.lock().unwrap().push("pong".into()))
            }),
        };
        (seen, callbacks)
    }

    #[test]
    fn dispatch_routes_each_subgroup() {
        let (seen, callbacks) = recorder();

        dispatch_workspace_message(
            WorkspaceMessage::ShellOutput { data: "$ ".into() },
            &callbacks,
        );
        dispatch_workspace_message(
            WorkspaceMessage::ShellExit {
                exit_code: Some(0),
                respawning: false,
            },
            &callbacks,
        );
        dispatch_workspace_message(
            WorkspaceMessage::GitStatus {
                status: GitStatus {
                    branch: "main".into(),
                    ahead: 0,
                    behind: 0,
                    dirty: true,
                    files: vec![GitFileStatus {
                        path: "a.txt".into(),
                        status: " M".into(),
                    }],
                },
            },
            &callbacks,
        );
        dispatch_workspace_message(
            WorkspaceMessage::ProcessOutput {
                process_id: "p1".into(),
                data: "out".into(),
            },
            &callbacks,
        );
        dispatch_workspace_message(
            WorkspaceMessage::Connected {
                session_id: "S1".into(),
            },
            &callbacks,
        );
        dispatch_workspace_message(WorkspaceMessage::Pong, &callbacks);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "shell:$ ");
        assert_eq!(seen[1], "exit:Some(0):false");
        assert!(seen[2].starts_with("git:"));
        assert!(seen[3].starts_with("proc:"));
        assert_eq!(seen[4], "connected:S1");
        assert_eq!(seen[5], "pong");
    }

    #[test]
    fn missing_callbacks_are_skipped_silently() {
        let callbacks = WorkspaceCallbacks::default();
        dispatch_workspace_message(
            WorkspaceMessage::ShellOutput { data: "x".into() },
            &callbacks,
        );
        dispatch_workspace_message(WorkspaceMessage::Pong, &callbacks);
        // No panic, nothing to assert.
    }

    #[test]
    fn inbound_only_types_are_ignored() {
        let (seen, callbacks) = recorder();
        dispatch_workspace_message(
            WorkspaceMessage::ShellInput { data: "ls".into() },
            &callbacks,
        );
        dispatch_workspace_message(WorkspaceMessage::Ping, &callbacks);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_stream_handshake_ping_and_close() {
        use crate::instance::process_manager::ProcessManager;
        use crate::instance::InstanceConfig;

        let dir = tempfile::TempDir::new().unwrap();
        let config = InstanceConfig {
            instance_id: "E1".into(),
            session_id: "S-live".into(),
            port: 0,
            protocol: "acp".into(),
            agent_argv: vec!["/bin/cat".into()],
            workdir: dir.path().to_path_buf(),
            env: std::collections::HashMap::new(),
            approval_policy: "prompt".into(),
            auto_start: false,
            shell_enabled: false,
            vscode_command: None,
            process_buffer_max_bytes: 4096,
            mcp_servers: Vec::new(),
        };
        let pm = ProcessManager::new(config).unwrap();
        let app = crate::instance::http::router(Arc::clone(&pm));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (seen, callbacks) = recorder();
        let client = WorkspaceStreamClient::connect(
            &format!("ws://{addr}/api/v1/workspace/stream"),
            callbacks,
        )
        .await
        .unwrap();

        // Handshake lands first.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if seen.lock().unwrap().iter().any(|s| s == "connected:S-live") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no connected message");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Ping → pong.
        client.ping().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if seen.lock().unwrap().iter().any(|s| s == "pong") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no pong");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Tracker events flow through.
        pm.tracker()
            .publish(crate::workspace::WorkspaceEvent::ProcessOutput {
                process_id: "p9".into(),
                data: "live marker".into(),
            });
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if seen
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.starts_with("proc:") && s.contains("live marker"))
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no process event");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Close semantics.
        client.close().await;
        let err = client.write_shell_input("ls\n").await.unwrap_err();
        assert_eq!(err.to_string(), "workspace stream closed");
        let err = client.ping().await.unwrap_err();
        assert_eq!(err.to_string(), "workspace stream closed");

        pm.stop().await;
    }
}
