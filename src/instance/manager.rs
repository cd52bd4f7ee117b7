//! Instance lifecycle: port binding, serve task, teardown.
//!
//! The manager owns the port allocator and the registry of live instances.
//! Creating an instance walks the port range — allocate, try to bind, mark
//! unavailable on `EADDRINUSE` and retry — then builds the
//! [`ProcessManager`], obtains the router from the injected handler factory,
//! and serves it on the bound listener in a background task.
//!
//! Teardown removes the registry entry under the lock, releases the lock,
//! and only then cascades: process manager stop, graceful server shutdown
//! with a deadline, port release. A failed create releases its port (it is
//! only *marked* when the failure was the bind conflict itself).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::process_manager::ProcessManager;
use super::{InstanceConfig, McpServerDesc};
use crate::ports::PortAllocator;

/// Deadline for the HTTP server drain during stop.
const SERVER_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Builds the instance router for a process manager.
///
/// Injected so the serving surface stays swappable (tests register probe
/// routes; production uses [`super::http::router`]).
pub type HandlerFactory = Arc<dyn Fn(Arc<ProcessManager>) -> Router + Send + Sync>;

/// Parameters for creating one instance.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    pub instance_id: Option<String>,
    /// Session the instance serves.
    pub session_id: String,
    /// Workspace directory.
    pub workspace_path: PathBuf,
    /// Base agent command tokens (already resolved from configuration).
    pub agent_argv: Vec<String>,
    /// CLI flag that receives the workspace path (e.g. `--cwd`), composed
    /// onto the command when present.
    pub workspace_flag: Option<String>,
    /// Agent protocol label.
    pub protocol: String,
    /// Environment snapshot for the agent subprocess.
    pub env: HashMap<String, String>,
    /// Tool approval policy.
    pub approval_policy: String,
    /// Start an agent session at instance boot (standalone use; the
    /// control-plane launch path drives session creation itself).
    pub auto_start: bool,
    /// Whether the embedded shell is enabled.
    pub shell_enabled: bool,
    /// VS Code launch command.
    pub vscode_command: Option<String>,
    /// Byte cap for run-alongside output buffers.
    pub process_buffer_max_bytes: usize,
    /// Additional MCP servers to advertise.
    pub mcp_servers: Vec<McpServerDesc>,
}

/// A live instance as tracked by the manager.
struct InstanceEntry {
    port: u16,
    pm: Arc<ProcessManager>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

/// Handle returned by lookups.
#[derive(Clone)]
pub struct InstanceHandle {
    /// Instance id (equals the execution id).
    pub id: String,
    /// Bound private port.
    pub port: u16,
    /// HTTP base URL.
    pub base_url: String,
    /// The instance's process manager.
    pub pm: Arc<ProcessManager>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.id)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Creates and destroys per-session instances.
pub struct InstanceManager {
    ports: Arc<PortAllocator>,
    factory: HandlerFactory,
    instances: Mutex<HashMap<String, InstanceEntry>>,
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl InstanceManager {
    /// Create a manager over the given port range.
    #[must_use]
    pub fn new(ports: Arc<PortAllocator>, factory: HandlerFactory) -> Self {
        Self {
            ports,
            factory,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The port allocator (shared with status surfaces).
    #[must_use]
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Create an instance: allocate + bind a port, start the process
    /// manager, serve the HTTP surface. Returns `(instance_id, port)`.
    pub async fn create(&self, req: InstanceRequest) -> Result<(String, u16)> {
        let id = req
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Walk the range: a port the allocator considers free can still fail
        // to bind (TIME_WAIT, foreign process); those are marked and skipped.
        let mut bound = None;
        for _ in 0..self.ports.range_len() {
            let port = self.ports.allocate(&id)?;
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    bound = Some((port, listener));
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    log::warn!("[instance] port {port} in use, marking unavailable");
                    self.ports.mark_unavailable(port);
                }
                Err(e) => {
                    self.ports.release(port);
                    return Err(e).with_context(|| format!("failed to bind port {port}"));
                }
            }
        }
        let (port, listener) = bound.context("no bindable port in range")?;

        match self.start_on(&id, port, listener, req).await {
            Ok(()) => Ok((id, port)),
            Err(e) => {
                // Partial resources are cleaned before the error surfaces;
                // the port goes back to the pool (it bound fine).
                self.ports.release(port);
                Err(e)
            }
        }
    }

    async fn start_on(
        &self,
        id: &str,
        port: u16,
        listener: TcpListener,
        req: InstanceRequest,
    ) -> Result<()> {
        // Compose the effective agent command.
        let mut agent_argv = req.agent_argv;
        if let Some(flag) = req.workspace_flag {
            if !agent_argv.is_empty() {
                agent_argv.push(flag);
                agent_argv.push(req.workspace_path.to_string_lossy().into_owned());
            }
        }

        // Advertise the instance's own MCP endpoint alongside any extras.
        let mut mcp_servers = req.mcp_servers;
        mcp_servers.push(McpServerDesc {
            name: "kandev".to_string(),
            url: format!("http://127.0.0.1:{port}/sse"),
        });

        let config = InstanceConfig {
            instance_id: id.to_string(),
            session_id: req.session_id,
            port,
            protocol: req.protocol,
            agent_argv,
            workdir: req.workspace_path,
            env: req.env,
            approval_policy: req.approval_policy,
            auto_start: req.auto_start,
            shell_enabled: req.shell_enabled,
            vscode_command: req.vscode_command,
            process_buffer_max_bytes: req.process_buffer_max_bytes,
            mcp_servers,
        };

        // Tracker (and shell) start inside the process manager, before the
        // HTTP surface is reachable.
        let pm = ProcessManager::new(config).context("failed to start process manager")?;
        let app = (self.factory)(Arc::clone(&pm));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let instance_id = id.to_string();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                log::error!("[instance] server for {instance_id} failed: {e}");
            }
        });

        self.instances.lock().expect("instance lock poisoned").insert(
            id.to_string(),
            InstanceEntry {
                port,
                pm,
                shutdown_tx: Some(shutdown_tx),
                server,
            },
        );
        log::info!("[instance] {id} serving on 127.0.0.1:{port}");
        Ok(())
    }

    /// Look up a live instance.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<InstanceHandle> {
        let instances = self.instances.lock().expect("instance lock poisoned");
        instances.get(id).map(|entry| InstanceHandle {
            id: id.to_string(),
            port: entry.port,
            base_url: format!("http://127.0.0.1:{}", entry.port),
            pm: Arc::clone(&entry.pm),
        })
    }

    /// Ids of all live instances.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.instances
            .lock()
            .expect("instance lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Stop an instance: registry removal, process cascade, server drain,
    /// port release.
    pub async fn stop(&self, id: &str) -> Result<()> {
        // Remove under the lock, then release it before any awaits.
        let entry = {
            let mut instances = self.instances.lock().expect("instance lock poisoned");
            instances.remove(id)
        };
        let Some(mut entry) = entry else {
            anyhow::bail!("unknown instance: {id}");
        };

        entry.pm.stop().await;

        // Sweep children the agent left behind (no-op outside managed
        // session directories).
        let workdir = entry.pm.config().workdir.clone();
        tokio::task::spawn_blocking(move || {
            crate::process::kill_orphaned_processes(&workdir);
        });

        if let Some(tx) = entry.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SERVER_DRAIN_DEADLINE, &mut entry.server)
            .await
            .is_err()
        {
            log::warn!("[instance] server drain deadline hit for {id}, aborting");
            entry.server.abort();
        }

        self.ports.release(entry.port);
        log::info!("[instance] {id} stopped, port {} released", entry.port);
        Ok(())
    }

    /// Stop every live instance (control-plane shutdown).
    pub async fn stop_all(&self) {
        for id in self.list() {
            if let Err(e) = self.stop(&id).await {
                log::warn!("[instance] stop {id} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> InstanceRequest {
        InstanceRequest {
            instance_id: None,
            session_id: "S1".into(),
            workspace_path: dir.to_path_buf(),
            agent_argv: vec!["/bin/cat".into()],
            workspace_flag: None,
            protocol: "acp".into(),
            env: HashMap::new(),
            approval_policy: "prompt".into(),
            auto_start: false,
            shell_enabled: false,
            vscode_command: None,
            process_buffer_max_bytes: 4096,
            mcp_servers: Vec::new(),
        }
    }

    fn manager(base: u16, max: u16) -> InstanceManager {
        InstanceManager::new(
            Arc::new(PortAllocator::new(base, max)),
            Arc::new(|pm| super::super::http::router(pm)),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_serves_health_and_stop_releases_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = manager(20801, 20810);

        let (id, port) = mgr.create(request(dir.path())).await.unwrap();
        assert!((20801..=20810).contains(&port));
        assert_eq!(mgr.ports().allocated_count(), 1);

        let handle = mgr.get(&id).expect("instance registered");
        let health: serde_json::Value = reqwest::get(format!("{}/health", handle.base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        mgr.stop(&id).await.unwrap();
        assert!(mgr.get(&id).is_none());
        assert_eq!(mgr.ports().allocated_count(), 0);

        // The port is reusable afterwards.
        let (_id2, port2) = mgr.create(request(dir.path())).await.unwrap();
        assert_eq!(port2, port);
        mgr.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_conflict_skips_to_next_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = manager(20821, 20825);

        // Occupy the first port externally.
        let _blocker = TcpListener::bind(("127.0.0.1", 20821)).await.unwrap();

        let (id, port) = mgr.create(request(dir.path())).await.unwrap();
        assert_eq!(port, 20822, "conflicted port must be skipped");

        mgr.stop(&id).await.unwrap();

        // 20821 was marked unavailable, so the next create skips it too.
        let (id2, port2) = mgr.create(request(dir.path())).await.unwrap();
        assert_eq!(port2, 20822);
        mgr.stop(&id2).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_range_reports_contract_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = manager(20831, 20832);

        let _a = mgr.create(request(dir.path())).await.unwrap();
        let _b = mgr.create(request(dir.path())).await.unwrap();
        let err = mgr.create(request(dir.path())).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("no available ports in range [20831, 20832]"),
            "got: {err}"
        );
        mgr.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_unknown_instance_errors() {
        let mgr = manager(20841, 20842);
        let err = mgr.stop("ghost").await.unwrap_err();
        assert!(err.to_string().contains("unknown instance: ghost"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn workspace_flag_composes_agent_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = manager(20851, 20855);
        let mut req = request(dir.path());
        req.workspace_flag = Some("--cwd".into());

        let (id, _port) = mgr.create(req).await.unwrap();
        let handle = mgr.get(&id).unwrap();
        let argv = &handle.pm.config().agent_argv;
        assert_eq!(argv[0], "/bin/cat");
        assert_eq!(argv[1], "--cwd");
        assert_eq!(argv[2], dir.path().to_string_lossy());

        // The kandev MCP server points at the instance's own /sse.
        let mcp = &handle.pm.config().mcp_servers;
        assert!(mcp.iter().any(|s| s.name == "kandev" && s.url.ends_with("/sse")));

        mgr.stop(&id).await.unwrap();
    }
}
