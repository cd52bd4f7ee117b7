//! Per-session instance: HTTP+WebSocket surface on a private port.
//!
//! An instance is bound to one workspace and one agent. The control plane
//! creates it through [`manager::InstanceManager`], which allocates a port,
//! builds the [`InstanceConfig`], wires a [`process_manager::ProcessManager`],
//! and serves the [`http`] router on the bound listener.

pub mod agent;
pub mod agent_stream;
pub mod http;
pub mod manager;
pub mod mcp;
pub mod process_manager;
pub mod runner;
pub mod workspace_stream;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Descriptor for an MCP server exposed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDesc {
    /// Server name as presented to the agent.
    pub name: String,
    /// SSE endpoint URL.
    pub url: String,
}

/// Everything an instance needs to run, assembled by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance id (equals the execution id).
    pub instance_id: String,
    /// Session this instance serves.
    pub session_id: String,
    /// Private TCP port the HTTP surface listens on.
    pub port: u16,
    /// Agent protocol label (`acp`, `codex`, `rest`).
    pub protocol: String,
    /// Agent command tokens; empty disables the agent subprocess.
    pub agent_argv: Vec<String>,
    /// Workspace directory.
    pub workdir: PathBuf,
    /// Environment snapshot for the agent subprocess.
    pub env: HashMap<String, String>,
    /// Tool approval policy handed to the agent (`auto` or `prompt`).
    pub approval_policy: String,
    /// Start an agent session as soon as the instance is up, without
    /// waiting for a control-plane handshake.
    pub auto_start: bool,
    /// Whether the embedded PTY shell is enabled.
    pub shell_enabled: bool,
    /// VS Code launch command, when configured.
    pub vscode_command: Option<String>,
    /// Byte cap for run-alongside process output buffers.
    pub process_buffer_max_bytes: usize,
    /// MCP servers advertised to the agent (includes the auto-injected
    /// `kandev` entry pointing at this instance's own `/sse`).
    pub mcp_servers: Vec<McpServerDesc>,
}

impl InstanceConfig {
    /// Base URL of the instance HTTP surface.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// WebSocket URL of the agent stream.
    #[must_use]
    pub fn agent_stream_url(&self) -> String {
        format!("ws://127.0.0.1:{}/api/v1/agent/stream", self.port)
    }

    /// WebSocket URL of the workspace stream.
    #[must_use]
    pub fn workspace_stream_url(&self) -> String {
        format!("ws://127.0.0.1:{}/api/v1/workspace/stream", self.port)
    }
}
