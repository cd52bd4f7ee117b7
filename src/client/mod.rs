//! Control-plane clients for the per-instance streams.
//!
//! The control plane holds one logical connection pair per execution: an
//! [`AgentStreamClient`] for RPC + notifications + the MCP tunnel, and a
//! [`WorkspaceStreamClient`] for shell/Git/file/process traffic. The
//! [`ClientRegistry`] maps sessions to their pair.

pub mod agent_stream;
pub mod registry;
pub mod workspace_stream;

pub use agent_stream::{AgentStreamClient, RpcError};
pub use registry::{ClientRegistry, SessionClients};
pub use workspace_stream::{dispatch_workspace_message, WorkspaceCallbacks, WorkspaceStreamClient};
