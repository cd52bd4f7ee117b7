//! Orphan process cleanup for torn-down workspaces.
//!
//! Agents spawn children (dev servers, watchers) that can outlive the
//! instance if the agent dies uncleanly. On teardown we look for processes
//! whose working directory sits inside the session workspace and terminate
//! them: SIGTERM first, SIGKILL for stragglers after a grace window.
//!
//! # Safeguards
//!
//! Only workspaces under an `agentctl-sessions` directory are swept — an
//! instance pointed at an arbitrary user directory never triggers process
//! killing. The current process and its parent are always excluded.
//!
//! # Platform support
//!
//! Linux reads `/proc/<pid>/cwd` symlinks; other platforms are a no-op.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Directory marker that opts a workspace into orphan sweeping.
const SESSIONS_MARKER: &str = "agentctl-sessions";

/// Kill processes whose CWD is inside `workspace`, honoring the safeguards.
pub fn kill_orphaned_processes(workspace: &Path) {
    let workspace_str = workspace.to_string_lossy();
    if !workspace_str.contains(SESSIONS_MARKER) {
        log::debug!("[orphan-cleanup] skipping non-managed path: {workspace_str}");
        return;
    }

    let our_pid = std::process::id();
    let our_ppid = get_parent_pid(our_pid);
    let pids = find_processes_in_directory(workspace, our_pid, our_ppid);
    if pids.is_empty() {
        log::debug!("[orphan-cleanup] no orphans under {workspace_str}");
        return;
    }

    log::info!(
        "[orphan-cleanup] terminating {} orphan(s) under {workspace_str}",
        pids.len()
    );
    graceful_kill_processes(&pids);
}

/// Processes with their working directory inside `workspace`.
fn find_processes_in_directory(
    workspace: &Path,
    exclude_pid: u32,
    exclude_ppid: Option<u32>,
) -> Vec<u32> {
    let workspace_str = workspace.to_string_lossy();
    let mut pids = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc") {
            for entry in entries.flatten() {
                let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                    continue;
                };
                if pid == exclude_pid || Some(pid) == exclude_ppid {
                    continue;
                }
                let cwd_link = format!("/proc/{pid}/cwd");
                if let Ok(cwd) = std::fs::read_link(&cwd_link) {
                    let cwd_str = cwd.to_string_lossy();
                    if cwd_str == workspace_str
                        || cwd_str.starts_with(&format!("{workspace_str}/"))
                    {
                        log::debug!("[orphan-cleanup] found pid {pid} (cwd {cwd_str})");
                        pids.push(pid);
                    }
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (workspace_str, exclude_pid, exclude_ppid);
    }

    pids
}

/// SIGTERM, wait up to three seconds, then SIGKILL the survivors.
fn graceful_kill_processes(pids: &[u32]) {
    for pid in pids {
        let _ = Command::new("kill").arg(pid.to_string()).output();
    }

    for _ in 0..6 {
        std::thread::sleep(Duration::from_millis(500));
        let any_alive = pids.iter().any(|pid| {
            Command::new("kill")
                .arg("-0")
                .arg(pid.to_string())
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        });
        if !any_alive {
            return;
        }
    }

    for pid in pids {
        if Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
        {
            log::debug!("[orphan-cleanup] SIGKILL pid {pid}");
            let _ = Command::new("kill").arg("-9").arg(pid.to_string()).output();
        }
    }
}

/// Parent pid of `pid`, when determinable.
pub fn get_parent_pid(pid: u32) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // Format: pid (comm) state ppid …
        stat.split_whitespace().nth(3)?.parse().ok()
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parent_pid_of_current_process() {
        let ppid = get_parent_pid(std::process::id());
        #[cfg(target_os = "linux")]
        {
            let ppid = ppid.expect("linux exposes ppid");
            assert_ne!(ppid, std::process::id());
        }
        #[cfg(not(target_os = "linux"))]
        assert!(ppid.is_none());
    }

    #[test]
    fn parent_pid_of_bogus_process_is_none() {
        assert!(get_parent_pid(u32::MAX).is_none());
    }

    #[test]
    fn non_managed_paths_are_skipped() {
        // Must return without touching anything.
        kill_orphaned_processes(&PathBuf::from("/tmp/some-random-path"));
    }

    #[test]
    fn finder_excludes_self_and_parent() {
        let our_pid = std::process::id();
        let our_ppid = get_parent_pid(our_pid);
        let fake = PathBuf::from("/nonexistent/agentctl-sessions/test");
        let pids = find_processes_in_directory(&fake, our_pid, our_ppid);
        assert!(!pids.contains(&our_pid));
        if let Some(ppid) = our_ppid {
            assert!(!pids.contains(&ppid));
        }
    }
}
