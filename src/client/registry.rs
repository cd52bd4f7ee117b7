//! Registry of per-session stream client pairs.
//!
//! One logical connection pair exists per execution; handlers look clients
//! up by session id under a read lock (shell input is the hot path). The
//! registry also owns the VS Code proxy cache — per-process state that lives
//! on a service, not in a global — invalidated explicitly from the lifecycle
//! path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::agent_stream::AgentStreamClient;
use super::workspace_stream::WorkspaceStreamClient;

/// The stream client pair for one execution.
#[derive(Clone)]
pub struct SessionClients {
    /// Execution the pair belongs to.
    pub execution_id: String,
    /// RPC + notification + MCP tunnel stream.
    pub agent: Arc<AgentStreamClient>,
    /// Shell/Git/file/process stream.
    pub workspace: Arc<WorkspaceStreamClient>,
}

impl std::fmt::Debug for SessionClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClients")
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

/// Session-keyed store of live stream clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, SessionClients>>,
    vscode_proxy: Mutex<HashMap<String, String>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client pair for a session, replacing any prior pair.
    pub fn register(&self, session_id: &str, clients: SessionClients) {
        self.clients
            .write()
            .expect("client registry lock poisoned")
            .insert(session_id.to_string(), clients);
    }

    /// Look up the pair for a session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionClients> {
        self.clients
            .read()
            .expect("client registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Remove the pair for a session (teardown path).
    pub fn remove(&self, session_id: &str) -> Option<SessionClients> {
        self.vscode_proxy
            .lock()
            .expect("proxy cache lock poisoned")
            .remove(session_id);
        self.clients
            .write()
            .expect("client registry lock poisoned")
            .remove(session_id)
    }

    /// Sessions with live client pairs.
    #[must_use]
    pub fn sessions(&self) -> Vec<String> {
        self.clients
            .read()
            .expect("client registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Cache the VS Code proxy URL for a session.
    pub fn cache_proxy(&self, session_id: &str, url: &str) {
        self.vscode_proxy
            .lock()
            .expect("proxy cache lock poisoned")
            .insert(session_id.to_string(), url.to_string());
    }

    /// Cached proxy URL, when present.
    #[must_use]
    pub fn cached_proxy(&self, session_id: &str) -> Option<String> {
        self.vscode_proxy
            .lock()
            .expect("proxy cache lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Drop the cached proxy URL (called from the lifecycle path when the
    /// instance goes away).
    pub fn invalidate_proxy(&self, session_id: &str) {
        self.vscode_proxy
            .lock()
            .expect("proxy cache lock poisoned")
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_cache_round_trip() {
        let registry = ClientRegistry::new();
        assert!(registry.cached_proxy("S1").is_none());
        registry.cache_proxy("S1", "/vscode/S1/?folder=/w");
        assert_eq!(
            registry.cached_proxy("S1").as_deref(),
            Some("/vscode/S1/?folder=/w")
        );
        registry.invalidate_proxy("S1");
        assert!(registry.cached_proxy("S1").is_none());
    }

    #[test]
    fn unknown_session_lookup_is_none() {
        let registry = ClientRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.remove("nope").is_none());
        assert!(registry.sessions().is_empty());
    }
}
