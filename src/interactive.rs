//! Auxiliary interactive shells and passthrough PTY contract.
//!
//! `user_shell.*` actions and agent stdin passthrough resolve through this
//! seam. The shipped [`ShellRunner`] is a registry of extra [`ShellSession`]s
//! keyed by session; passthrough mode is entered by registering a script
//! shell for the session and exited when that shell is stopped. Deployments
//! with richer runners swap the trait object at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::shell::{ShellSession, ShellSpec};

/// Descriptor for one auxiliary shell.
#[derive(Debug, Clone, Serialize)]
pub struct UserShellInfo {
    /// Runner-assigned shell id.
    pub shell_id: String,
    /// OS pid of the shell process.
    pub pid: Option<u32>,
    /// Whether the shell is alive.
    pub running: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Contract for auxiliary interactive shells and the passthrough PTY.
#[async_trait]
pub trait InteractiveRunner: Send + Sync {
    /// Auxiliary shells for a session.
    async fn list_user_shells(&self, session_id: &str) -> Result<Vec<UserShellInfo>>;
    /// Create an auxiliary shell in `workdir`.
    async fn create_user_shell(&self, session_id: &str, workdir: &Path) -> Result<UserShellInfo>;
    /// Stop one auxiliary shell.
    async fn stop_user_shell(&self, session_id: &str, shell_id: &str) -> Result<()>;
    /// Mark an existing shell as the session's passthrough script shell.
    async fn register_script_shell(&self, session_id: &str, shell_id: &str) -> Result<()>;
    /// Write to the passthrough PTY; fails when the session is not in
    /// passthrough mode.
    async fn write_passthrough_stdin(&self, session_id: &str, data: &[u8]) -> Result<()>;
    /// Resize the passthrough PTY; same precondition.
    async fn resize_passthrough_pty(&self, session_id: &str, cols: u16, rows: u16) -> Result<()>;
}

struct ShellEntry {
    shell: Arc<ShellSession>,
    created_at: DateTime<Utc>,
}

/// Registry-backed default runner.
#[derive(Default)]
pub struct ShellRunner {
    /// session id → shell id → entry.
    shells: Mutex<HashMap<String, HashMap<String, ShellEntry>>>,
    /// session id → passthrough shell id.
    passthrough: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for ShellRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellRunner").finish_non_exhaustive()
    }
}

impl ShellRunner {
    /// Create an empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn passthrough_shell(&self, session_id: &str) -> Result<Arc<ShellSession>> {
        let shell_id = self
            .passthrough
            .lock()
            .expect("passthrough lock poisoned")
            .get(session_id)
            .cloned();
        let Some(shell_id) = shell_id else {
            bail!("session not in passthrough mode");
        };
        let shells = self.shells.lock().expect("shell registry lock poisoned");
        shells
            .get(session_id)
            .and_then(|m| m.get(&shell_id))
            .map(|e| Arc::clone(&e.shell))
            .ok_or_else(|| anyhow::anyhow!("session not in passthrough mode"))
    }

    /// Stop every shell (control-plane shutdown).
    pub async fn stop_all(&self) {
        let all: Vec<Arc<ShellSession>> = {
            let mut shells = self.shells.lock().expect("shell registry lock poisoned");
            shells
                .drain()
                .flat_map(|(_, m)| m.into_values().map(|e| e.shell))
                .collect()
        };
        self.passthrough
            .lock()
            .expect("passthrough lock poisoned")
            .clear();
        for shell in all {
            shell.stop().await;
        }
    }
}

#[async_trait]
impl InteractiveRunner for ShellRunner {
    async fn list_user_shells(&self, session_id: &str) -> Result<Vec<UserShellInfo>> {
        let shells = self.shells.lock().expect("shell registry lock poisoned");
        Ok(shells
            .get(session_id)
            .map(|m| {
                m.iter()
                    .map(|(id, entry)| UserShellInfo {
                        shell_id: id.clone(),
                        pid: entry.shell.pid(),
                        running: entry.shell.is_running(),
                        created_at: entry.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_user_shell(&self, session_id: &str, workdir: &Path) -> Result<UserShellInfo> {
        let shell = ShellSession::spawn(ShellSpec::for_workspace(PathBuf::from(workdir)))?;
        let shell_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let info = UserShellInfo {
            shell_id: shell_id.clone(),
            pid: shell.pid(),
            running: shell.is_running(),
            created_at,
        };
        self.shells
            .lock()
            .expect("shell registry lock poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(shell_id, ShellEntry { shell, created_at });
        Ok(info)
    }

    async fn stop_user_shell(&self, session_id: &str, shell_id: &str) -> Result<()> {
        let entry = {
            let mut shells = self.shells.lock().expect("shell registry lock poisoned");
            shells
                .get_mut(session_id)
                .and_then(|m| m.remove(shell_id))
        };
        let Some(entry) = entry else {
            bail!("unknown user shell: {shell_id}");
        };
        {
            let mut passthrough = self.passthrough.lock().expect("passthrough lock poisoned");
            if passthrough.get(session_id).map(String::as_str) == Some(shell_id) {
                passthrough.remove(session_id);
            }
        }
        entry.shell.stop().await;
        Ok(())
    }

    async fn register_script_shell(&self, session_id: &str, shell_id: &str) -> Result<()> {
        let exists = self
            .shells
            .lock()
            .expect("shell registry lock poisoned")
            .get(session_id)
            .is_some_and(|m| m.contains_key(shell_id));
        if !exists {
            bail!("unknown user shell: {shell_id}");
        }
        self.passthrough
            .lock()
            .expect("passthrough lock poisoned")
            .insert(session_id.to_string(), shell_id.to_string());
        Ok(())
    }

    async fn write_passthrough_stdin(&self, session_id: &str, data: &[u8]) -> Result<()> {
        self.passthrough_shell(session_id)?.write(data)
    }

    async fn resize_passthrough_pty(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.passthrough_shell(session_id)?.resize(cols, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn passthrough_requires_registration() {
        let runner = ShellRunner::new();
        let err = runner
            .write_passthrough_stdin("S1", b"ls\n")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "session not in passthrough mode");

        let err = runner.resize_passthrough_pty("S1", 80, 24).await.unwrap_err();
        assert_eq!(err.to_string(), "session not in passthrough mode");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shell_lifecycle_and_passthrough() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ShellRunner::new();

        assert!(runner.list_user_shells("S1").await.unwrap().is_empty());

        let info = runner.create_user_shell("S1", dir.path()).await.unwrap();
        assert!(info.running);
        assert_eq!(runner.list_user_shells("S1").await.unwrap().len(), 1);

        // Registration flips the session into passthrough mode.
        runner
            .register_script_shell("S1", &info.shell_id)
            .await
            .unwrap();
        runner
            .write_passthrough_stdin("S1", b"echo passthrough\n")
            .await
            .unwrap();
        runner.resize_passthrough_pty("S1", 100, 30).await.unwrap();

        // Stopping the shell drops passthrough mode with it.
        runner.stop_user_shell("S1", &info.shell_id).await.unwrap();
        let err = runner
            .write_passthrough_stdin("S1", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "session not in passthrough mode");
        assert!(runner.list_user_shells("S1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_shell_operations_error() {
        let runner = ShellRunner::new();
        assert!(runner.stop_user_shell("S1", "nope").await.is_err());
        assert!(runner.register_script_shell("S1", "nope").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sessions_are_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ShellRunner::new();
        let info = runner.create_user_shell("S1", dir.path()).await.unwrap();
        runner
            .register_script_shell("S1", &info.shell_id)
            .await
            .unwrap();

        // S2 has no shells and no passthrough.
        assert!(runner.list_user_shells("S2").await.unwrap().is_empty());
        let err = runner.write_passthrough_stdin("S2", b"x").await.unwrap_err();
        assert_eq!(err.to_string(), "session not in passthrough mode");

        runner.stop_all().await;
    }
}
