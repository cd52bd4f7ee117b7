//! Workspace observation: Git state and filesystem changes.

pub mod git;
pub mod tracker;

pub use git::{GitFileStatus, GitStatus};
pub use tracker::{FileChangeKind, WorkspaceEvent, WorkspaceTracker};
