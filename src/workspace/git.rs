//! Git operations against a session workspace.
//!
//! Shells out to the `git` CLI rather than linking a libgit2 binding: the
//! operations here are a thin status/commit/reset surface and the CLI handles
//! worktrees, sparse checkouts, and config quirks uniformly.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One changed file from `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitFileStatus {
    /// Path relative to the repository root.
    pub path: String,
    /// Two-character porcelain status code (e.g. ` M`, `??`, `A `).
    pub status: String,
}

/// Snapshot of the workspace Git state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GitStatus {
    /// Current branch name; empty when detached.
    pub branch: String,
    /// Commits ahead of upstream.
    pub ahead: u32,
    /// Commits behind upstream.
    pub behind: u32,
    /// Whether any tracked or untracked changes exist.
    pub dirty: bool,
    /// Changed files.
    pub files: Vec<GitFileStatus>,
}

/// Whether `workdir` is inside a Git work tree.
#[must_use]
pub fn is_git_repo(workdir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(workdir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Read the current status via `git status --porcelain=v1 --branch`.
pub fn status(workdir: &Path) -> Result<GitStatus> {
    let output = Command::new("git")
        .args(["status", "--porcelain=v1", "--branch"])
        .current_dir(workdir)
        .output()
        .context("failed to run git status")?;
    if !output.status.success() {
        bail!(
            "git status failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
}

/// Stage everything and commit; returns the new commit id.
pub fn commit(workdir: &Path, message: &str) -> Result<String> {
    if message.trim().is_empty() {
        bail!("commit message is required");
    }

    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(workdir)
        .output()
        .context("failed to run git add")?;
    if !add.status.success() {
        bail!(
            "git add failed: {}",
            String::from_utf8_lossy(&add.stderr).trim()
        );
    }

    let commit = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(workdir)
        .output()
        .context("failed to run git commit")?;
    if !commit.status.success() {
        bail!(
            "git commit failed: {}",
            String::from_utf8_lossy(&commit.stderr).trim()
        );
    }

    let rev = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workdir)
        .output()
        .context("failed to run git rev-parse")?;
    Ok(String::from_utf8_lossy(&rev.stdout).trim().to_string())
}

/// Reset the work tree. `hard` discards local changes; `target` defaults to
/// `HEAD`.
pub fn reset(workdir: &Path, hard: bool, target: Option<&str>) -> Result<()> {
    let mut args = vec!["reset"];
    if hard {
        args.push("--hard");
    }
    let target = target.unwrap_or("HEAD");
    args.push(target);

    let output = Command::new("git")
        .args(&args)
        .current_dir(workdir)
        .output()
        .context("failed to run git reset")?;
    if !output.status.success() {
        bail!(
            "git reset failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Parse `git status --porcelain=v1 --branch` output.
fn parse_porcelain(text: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in text.lines() {
        if let Some(branch_line) = line.strip_prefix("## ") {
            parse_branch_line(branch_line, &mut status);
        } else if line.len() >= 3 {
            status.files.push(GitFileStatus {
                status: line[..2].to_string(),
                path: line[3..].to_string(),
            });
        }
    }

    status.dirty = !status.files.is_empty();
    status
}

/// Parse the `## branch...upstream [ahead N, behind M]` header line.
fn parse_branch_line(line: &str, status: &mut GitStatus) {
    // Examples:
    //   main
    //   main...origin/main [ahead 1, behind 2]
    //   HEAD (no branch)
    let head = line.split(" [").next().unwrap_or(line);
    status.branch = head
        .split("...")
        .next()
        .unwrap_or(head)
        .trim()
        .to_string();

    if let Some(rest) = line.split('[').nth(1) {
        let rest = rest.trim_end_matches(']');
        for part in rest.split(',') {
            let part = part.trim();
            if let Some(n) = part.strip_prefix("ahead ") {
                status.ahead = n.parse().unwrap_or(0);
            } else if let Some(n) = part.strip_prefix("behind ") {
                status.behind = n.parse().unwrap_or(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_clean_tree() {
        let status = parse_porcelain("## main...origin/main\n");
        assert_eq!(status.branch, "main");
        assert_eq!(status.ahead, 0);
        assert_eq!(status.behind, 0);
        assert!(!status.dirty);
        assert!(status.files.is_empty());
    }

    #[test]
    fn parse_ahead_behind() {
        let status = parse_porcelain("## feature...origin/feature [ahead 3, behind 1]\n");
        assert_eq!(status.branch, "feature");
        assert_eq!(status.ahead, 3);
        assert_eq!(status.behind, 1);
    }

    #[test]
    fn parse_dirty_files() {
        let text = "## main\n M src/lib.rs\n?? new_file.txt\nA  staged.rs\n";
        let status = parse_porcelain(text);
        assert!(status.dirty);
        assert_eq!(status.files.len(), 3);
        assert_eq!(status.files[0].status, " M");
        assert_eq!(status.files[0].path, "src/lib.rs");
        assert_eq!(status.files[1].status, "??");
        assert_eq!(status.files[1].path, "new_file.txt");
    }

    #[test]
    fn parse_detached_head() {
        let status = parse_porcelain("## HEAD (no branch)\n");
        assert_eq!(status.branch, "HEAD (no branch)");
    }

    #[test]
    fn empty_commit_message_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = commit(dir.path(), "   ").unwrap_err();
        assert!(err.to_string().contains("message is required"));
    }

    #[test]
    fn non_repo_is_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(!is_git_repo(dir.path()));
        assert!(status(dir.path()).is_err());
    }

    /// End-to-end against a real scratch repository.
    #[test]
    fn status_commit_reset_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path();
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(path)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?}: {out:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);

        std::fs::write(path.join("a.txt"), "one").unwrap();
        let st = status(path).unwrap();
        assert!(st.dirty);
        assert_eq!(st.files[0].path, "a.txt");

        let commit_id = commit(path, "add a.txt").unwrap();
        assert_eq!(commit_id.len(), 40);
        assert!(!status(path).unwrap().dirty);

        std::fs::write(path.join("a.txt"), "two").unwrap();
        assert!(status(path).unwrap().dirty);
        reset(path, true, None).unwrap();
        assert!(!status(path).unwrap().dirty);
        assert_eq!(std::fs::read_to_string(path.join("a.txt")).unwrap(), "one");
    }
}
