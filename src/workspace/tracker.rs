//! Workspace tracker: filesystem watcher + Git status poller.
//!
//! One tracker runs per instance, started before the agent so auxiliary
//! process output has somewhere to go from the first byte. It publishes
//! [`WorkspaceEvent`]s on a broadcast channel that the workspace stream (and
//! anything else instance-side) subscribes to:
//!
//! - `FileChange` from a recursive `notify` watch on the workspace,
//!   `.git/` internals excluded;
//! - `GitStatus` from a 2 s poller that only emits when the status actually
//!   changed;
//! - `GitCommit` / `GitReset` injected by the HTTP git handlers;
//! - `ProcessOutput` / `ProcessStatus` injected by the process runner.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::git::{self, GitStatus};

/// Broadcast channel capacity for workspace events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Git status poll cadence.
const GIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Classification of a filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    /// A new file or directory was created.
    Create,
    /// File content or metadata was modified (not a rename).
    Modify,
    /// A file or directory was renamed or moved.
    Rename,
    /// A file or directory was deleted.
    Delete,
    /// Event type not mapped to a specific category.
    Other,
}

/// An event observed in (or injected into) the workspace.
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    /// A file inside the workspace changed.
    FileChange {
        /// Absolute path of the affected file.
        path: PathBuf,
        /// What happened to it.
        kind: FileChangeKind,
    },
    /// The Git status changed since the last poll.
    GitStatus(GitStatus),
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
    /// Output chunk from a run-alongside process.
    ProcessOutput {
        /// Runner-assigned process id.
        process_id: String,
        /// UTF-8 lossy output chunk.
        data: String,
    },
    /// State change of a run-alongside process.
    ProcessStatus {
        /// Runner-assigned process id.
        process_id: String,
        /// `running`, `exited`, `failed`.
        status: String,
        /// Exit code when exited.
        exit_code: Option<i32>,
    },
}

/// Filesystem + Git observer for one workspace.
pub struct WorkspaceTracker {
    workdir: PathBuf,
    events_tx: broadcast::Sender<WorkspaceEvent>,
    /// Kept alive for the lifetime of the tracker; dropping it stops the
    /// OS-level watches.
    watcher: Mutex<Option<RecommendedWatcher>>,
    stopped: Arc<AtomicBool>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkspaceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceTracker")
            .field("workdir", &self.workdir)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WorkspaceTracker {
    /// Start tracking `workdir`.
    ///
    /// The watcher starts immediately; the Git poller only runs when the
    /// directory is a Git work tree.
    pub fn start(workdir: &Path) -> Result<Arc<Self>> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tracker = Arc::new(Self {
            workdir: workdir.to_path_buf(),
            events_tx,
            watcher: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        });

        tracker.start_watcher()?;
        if git::is_git_repo(workdir) {
            tracker.start_git_poller();
        } else {
            log::debug!(
                "[tracker] {} is not a git repo, status polling disabled",
                workdir.display()
            );
        }

        Ok(tracker)
    }

    /// Subscribe to workspace events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events_tx.subscribe()
    }

    /// Inject an event (git handlers, process runner).
    pub fn publish(&self, event: WorkspaceEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Workspace root this tracker observes.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Stop watching and polling. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        *self.watcher.lock().expect("watcher lock poisoned") = None;
        if let Some(handle) = self.poller.lock().expect("poller lock poisoned").take() {
            handle.abort();
        }
    }

    fn start_watcher(self: &Arc<Self>) -> Result<()> {
        let events_tx = self.events_tx.clone();
        let root = self.workdir.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let kind = classify(&event.kind);
                    for path in event.paths {
                        if in_git_dir(&root, &path) {
                            continue;
                        }
                        let _ = events_tx.send(WorkspaceEvent::FileChange { path, kind });
                    }
                }
                Err(e) => log::warn!("[tracker] watch error: {e}"),
            }
        })
        .context("failed to create file watcher")?;

        watcher
            .watch(&self.workdir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", self.workdir.display()))?;

        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        log::info!("[tracker] watching {}", self.workdir.display());
        Ok(())
    }

    fn start_git_poller(self: &Arc<Self>) {
        let events_tx = self.events_tx.clone();
        let workdir = self.workdir.clone();
        let stopped = Arc::clone(&self.stopped);

        let handle = tokio::spawn(async move {
            let mut last: Option<GitStatus> = None;
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let dir = workdir.clone();
                let status =
                    tokio::task::spawn_blocking(move || git::status(&dir)).await;
                match status {
                    Ok(Ok(status)) => {
                        if last.as_ref() != Some(&status) {
                            last = Some(status.clone());
                            let _ = events_tx.send(WorkspaceEvent::GitStatus(status));
                        }
                    }
                    Ok(Err(e)) => log::debug!("[tracker] git status failed: {e}"),
                    Err(e) => log::debug!("[tracker] git status task failed: {e}"),
                }
                tokio::time::sleep(GIT_POLL_INTERVAL).await;
            }
        });
        *self.poller.lock().expect("poller lock poisoned") = Some(handle);
    }
}

impl Drop for WorkspaceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map `notify::EventKind` to [`FileChangeKind`].
fn classify(kind: &notify::EventKind) -> FileChangeKind {
    match kind {
        notify::EventKind::Create(_) => FileChangeKind::Create,
        notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileChangeKind::Rename,
        notify::EventKind::Modify(_) => FileChangeKind::Modify,
        notify::EventKind::Remove(_) => FileChangeKind::Delete,
        _ => FileChangeKind::Other,
    }
}

/// True when `path` lives under the workspace's `.git/` directory.
fn in_git_dir(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| rel.components().next().is_some_and(|c| c.as_os_str() == ".git"))
        .unwrap_or(false)
}
