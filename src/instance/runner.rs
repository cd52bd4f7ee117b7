//! Run-alongside process runner (dev servers, scripts).
//!
//! Processes started here live next to the agent in the same workspace.
//! Output is captured into a per-process bounded ring and republished as
//! `process_output` workspace events, so the workspace stream carries it
//! live; a `process_status` event marks start and exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::ring::RingBuffer;
use crate::workspace::{WorkspaceEvent, WorkspaceTracker};

/// Snapshot of one managed process for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// Runner-assigned id.
    pub process_id: String,
    /// Shell command line the process was started with.
    pub command: String,
    /// `running`, `exited`, `failed`.
    pub status: String,
    /// Exit code when exited.
    pub exit_code: Option<i32>,
    /// OS pid while running.
    pub pid: Option<u32>,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
}

struct ProcEntry {
    info: ProcessInfo,
    buffer: Arc<Mutex<RingBuffer>>,
    child: Option<tokio::process::Child>,
}

/// Registry of run-alongside processes for one instance.
pub struct ProcessRunner {
    workdir: PathBuf,
    buffer_cap: usize,
    tracker: Arc<WorkspaceTracker>,
    procs: Arc<tokio::sync::Mutex<HashMap<String, ProcEntry>>>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

impl ProcessRunner {
    /// Create a runner publishing through `tracker`.
    #[must_use]
    pub fn new(workdir: PathBuf, buffer_cap: usize, tracker: Arc<WorkspaceTracker>) -> Self {
        Self {
            workdir,
            buffer_cap,
            tracker,
            procs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Start `command` via the shell; returns its descriptor.
    pub async fn start(&self, command: &str) -> Result<ProcessInfo> {
        if command.trim().is_empty() {
            bail!("command is required");
        }

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start process: {command}"))?;

        let process_id = uuid::Uuid::new_v4().to_string();
        let buffer = Arc::new(Mutex::new(RingBuffer::new(self.buffer_cap)));
        let info = ProcessInfo {
            process_id: process_id.clone(),
            command: command.to_string(),
            status: "running".to_string(),
            exit_code: None,
            pid: child.id(),
            started_at: Utc::now(),
        };

        let stdout = child.stdout.take().context("process stdout unavailable")?;
        let stderr = child.stderr.take().context("process stderr unavailable")?;

        self.pump_output(&process_id, stdout, Arc::clone(&buffer));
        self.pump_output(&process_id, stderr, Arc::clone(&buffer));

        self.tracker.publish(WorkspaceEvent::ProcessStatus {
            process_id: process_id.clone(),
            status: "running".to_string(),
            exit_code: None,
        });

        // Waiter: mark exit and publish the final status.
        {
            let procs = Arc::clone(&self.procs);
            let tracker = Arc::clone(&self.tracker);
            let process_id = process_id.clone();
            tokio::spawn(async move {
                let code = loop {
                    let mut guard = procs.lock().await;
                    let wait = guard
                        .get_mut(&process_id)
                        .and_then(|e| e.child.as_mut())
                        .map(tokio::process::Child::try_wait);
                    match wait {
                        Some(Ok(Some(status))) => {
                            let code = status.code();
                            if let Some(entry) = guard.get_mut(&process_id) {
                                entry.child = None;
                                entry.info.status = if status.success() {
                                    "exited".to_string()
                                } else {
                                    "failed".to_string()
                                };
                                entry.info.exit_code = code;
                                entry.info.pid = None;
                            }
                            break code;
                        }
                        Some(Ok(None)) => {}
                        Some(Err(e)) => {
                            log::warn!("[runner] wait failed for {process_id}: {e}");
                            if let Some(entry) = guard.get_mut(&process_id) {
                                entry.child = None;
                                entry.info.status = "failed".to_string();
                            }
                            break None;
                        }
                        None => return, // stopped explicitly
                    }
                    drop(guard);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                };

                let status = {
                    let guard = procs.lock().await;
                    guard
                        .get(&process_id)
                        .map_or_else(|| "exited".to_string(), |e| e.info.status.clone())
                };
                tracker.publish(WorkspaceEvent::ProcessStatus {
                    process_id,
                    status,
                    exit_code: code,
                });
            });
        }

        self.procs.lock().await.insert(
            process_id.clone(),
            ProcEntry {
                info: info.clone(),
                buffer,
                child: Some(child),
            },
        );

        log::info!("[runner] started {command:?} as {process_id}");
        Ok(info)
    }

    fn pump_output<R>(&self, process_id: &str, pipe: R, buffer: Arc<Mutex<RingBuffer>>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let tracker = Arc::clone(&self.tracker);
        let process_id = process_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut ring = buffer.lock().expect("process ring lock poisoned");
                    ring.push(line.as_bytes());
                    ring.push(b"\n");
                }
                tracker.publish(WorkspaceEvent::ProcessOutput {
                    process_id: process_id.clone(),
                    data: format!("{line}\n"),
                });
            }
        });
    }

    /// List all managed processes.
    pub async fn list(&self) -> Vec<ProcessInfo> {
        self.procs
            .lock()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Captured output for one process.
    pub async fn output(&self, process_id: &str) -> Result<String> {
        let procs = self.procs.lock().await;
        let entry = procs
            .get(process_id)
            .with_context(|| format!("unknown process: {process_id}"))?;
        let bytes = entry
            .buffer
            .lock()
            .expect("process ring lock poisoned")
            .to_vec();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Kill one process.
    pub async fn stop(&self, process_id: &str) -> Result<()> {
        let mut procs = self.procs.lock().await;
        let entry = procs
            .get_mut(process_id)
            .with_context(|| format!("unknown process: {process_id}"))?;
        if let Some(mut child) = entry.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            entry.info.status = "exited".to_string();
            entry.info.pid = None;
        }
        self.tracker.publish(WorkspaceEvent::ProcessStatus {
            process_id: process_id.to_string(),
            status: "exited".to_string(),
            exit_code: entry.info.exit_code,
        });
        Ok(())
    }

    /// Kill everything; used by the instance stop cascade.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.procs.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                log::warn!("[runner] stop {id} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn runner_in(dir: &std::path::Path) -> (ProcessRunner, Arc<WorkspaceTracker>) {
        let tracker = WorkspaceTracker::start(dir).unwrap();
        (
            ProcessRunner::new(dir.to_path_buf(), 4096, Arc::clone(&tracker)),
            tracker,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn output_is_captured_and_published() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runner, tracker) = runner_in(dir.path()).await;
        let mut events = tracker.subscribe();

        let info = runner.start("echo runner_marker").await.unwrap();
        assert_eq!(info.status, "running");

        // Wait for the output event to flow through the tracker.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = tokio::time::timeout(remaining, events.recv())
                .await
                .expect("timed out waiting for process output")
                .expect("event channel closed");
            if let WorkspaceEvent::ProcessOutput { process_id, data } = event {
                assert_eq!(process_id, info.process_id);
                assert!(data.contains("runner_marker"));
                break;
            }
        }

        // Captured in the ring too.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if runner
                .output(&info.process_id)
                .await
                .unwrap()
                .contains("runner_marker")
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracker.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exit_is_reflected_in_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runner, tracker) = runner_in(dir.path()).await;

        let info = runner.start("true").await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let list = runner.list().await;
            let entry = list.iter().find(|p| p.process_id == info.process_id).unwrap();
            if entry.status == "exited" {
                assert_eq!(entry.exit_code, Some(0));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "process never exited");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracker.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_command_reports_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runner, tracker) = runner_in(dir.path()).await;

        let info = runner.start("exit 3").await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let list = runner.list().await;
            let entry = list.iter().find(|p| p.process_id == info.process_id).unwrap();
            if entry.status != "running" {
                assert_eq!(entry.status, "failed");
                assert_eq!(entry.exit_code, Some(3));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracker.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_kills_long_running_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runner, tracker) = runner_in(dir.path()).await;

        let info = runner.start("sleep 60").await.unwrap();
        runner.stop(&info.process_id).await.unwrap();

        let list = runner.list().await;
        let entry = list.iter().find(|p| p.process_id == info.process_id).unwrap();
        assert_eq!(entry.status, "exited");
        assert!(entry.pid.is_none());
        tracker.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_process_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runner, tracker) = runner_in(dir.path()).await;
        assert!(runner.stop("nope").await.is_err());
        assert!(runner.output("nope").await.is_err());
        assert!(runner.start("   ").await.is_err());
        tracker.stop();
    }
}
