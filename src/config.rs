//! Configuration loading and persistence.
//!
//! Reads the optional config file at `{config_dir}/agentctl/config.json`,
//! then applies `AGENTCTL_*` environment overrides on top. Environment
//! always wins so deployments can be driven entirely from the environment
//! without a config file present.

use std::collections::HashMap;
use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::env::{
    APP_NAME, DEFAULT_CONTROL_PORT, DEFAULT_INSTANCE_PORT_BASE, DEFAULT_INSTANCE_PORT_MAX,
    DEFAULT_PROTOCOL,
};
use crate::ring::PROCESS_BUFFER_DEFAULT_CAP;

/// Control-plane configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Port the client-facing WebSocket dispatcher listens on.
    pub control_port: u16,
    /// Bottom of the private instance port range (inclusive).
    pub instance_port_base: u16,
    /// Top of the private instance port range (inclusive).
    pub instance_port_max: u16,
    /// Agent protocol label handed to instances (`acp`, `codex`, `rest`).
    pub protocol: String,
    /// Default agent command line, whitespace-tokenized at launch.
    pub agent_command: String,
    /// Default workspace directory when a launch omits one.
    pub workdir: Option<PathBuf>,
    /// Start the agent subprocess as soon as the instance is up.
    pub auto_start: bool,
    /// Whether instances host an embedded PTY shell.
    pub shell_enabled: bool,
    /// Command used to launch VS Code for a workspace, when configured.
    pub vscode_command: Option<String>,
    /// Byte cap for each run-alongside process output buffer.
    pub process_buffer_max_bytes: usize,
    /// Extra environment passed to every agent subprocess.
    #[serde(default)]
    pub agent_env: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            instance_port_base: DEFAULT_INSTANCE_PORT_BASE,
            instance_port_max: DEFAULT_INSTANCE_PORT_MAX,
            protocol: DEFAULT_PROTOCOL.to_string(),
            agent_command: String::new(),
            workdir: None,
            auto_start: false,
            shell_enabled: true,
            vscode_command: None,
            process_buffer_max_bytes: PROCESS_BUFFER_DEFAULT_CAP,
            agent_env: HashMap::new(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Priority: `AGENTCTL_CONFIG_DIR` override, project `tmp/` in test mode,
    /// then the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("AGENTCTL_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_any_test() {
            // Tests must not touch the real config dir.
            std::env::temp_dir().join("agentctl-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join(APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = parse_env::<u16>("AGENTCTL_PORT") {
            self.control_port = port;
        }
        if let Some(base) = parse_env::<u16>("AGENTCTL_INSTANCE_PORT_BASE") {
            self.instance_port_base = base;
        }
        if let Some(max) = parse_env::<u16>("AGENTCTL_INSTANCE_PORT_MAX") {
            self.instance_port_max = max;
        }
        if let Ok(protocol) = std::env::var("AGENTCTL_PROTOCOL") {
            self.protocol = protocol;
        }
        if let Ok(command) = std::env::var("AGENTCTL_AGENT_COMMAND") {
            self.agent_command = command;
        }
        if let Ok(workdir) = std::env::var("AGENTCTL_WORKDIR") {
            self.workdir = Some(PathBuf::from(workdir));
        }
        if let Some(auto) = parse_env::<bool>("AGENTCTL_AUTO_START") {
            self.auto_start = auto;
        }
        if let Some(enabled) = parse_env::<bool>("AGENTCTL_SHELL_ENABLED") {
            self.shell_enabled = enabled;
        }
        if let Ok(cmd) = std::env::var("AGENTCTL_VSCODE_COMMAND") {
            self.vscode_command = if cmd.is_empty() { None } else { Some(cmd) };
        }
        if let Some(cap) = parse_env::<usize>("AGENTCTL_PROCESS_BUFFER_MAX_BYTES") {
            self.process_buffer_max_bytes = cap;
        }
    }

    /// Reject configurations the serve loop cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.instance_port_max < self.instance_port_base {
            anyhow::bail!(
                "instance port range is inverted: [{}, {}]",
                self.instance_port_base,
                self.instance_port_max
            );
        }
        if self.process_buffer_max_bytes == 0 {
            anyhow::bail!("process_buffer_max_bytes must be > 0");
        }
        Ok(())
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Owner read/write only.
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Tokenize the configured agent command into argv form.
    ///
    /// Returns `None` when no command is configured.
    #[must_use]
    pub fn agent_argv(&self) -> Option<Vec<String>> {
        let tokens: Vec<String> = self
            .agent_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            None
        } else {
            Some(tokens)
        }
    }
}

/// Parse an env var, ignoring unset or unparseable values.
fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.instance_port_base, DEFAULT_INSTANCE_PORT_BASE);
        assert_eq!(config.instance_port_max, DEFAULT_INSTANCE_PORT_MAX);
        assert!(config.shell_enabled);
        assert!(!config.auto_start);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let config = Config {
            instance_port_base: 10010,
            instance_port_max: 10001,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inverted"), "got: {err}");
    }

    #[test]
    fn zero_process_buffer_is_rejected() {
        let config = Config {
            process_buffer_max_bytes: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn agent_argv_tokenizes_on_whitespace() {
        let config = Config {
            agent_command: "claude --output-format stream-json".to_string(),
            ..Config::default()
        };
        let argv = config.agent_argv().unwrap();
        assert_eq!(argv, ["claude", "--output-format", "stream-json"]);
    }

    #[test]
    fn agent_argv_empty_command_is_none() {
        let config = Config::default();
        assert!(config.agent_argv().is_none());
        let config = Config {
            agent_command: "   ".to_string(),
            ..Config::default()
        };
        assert!(config.agent_argv().is_none());
    }

    #[test]
    fn serialization_round_trips() {
        let mut config = Config::default();
        config.agent_command = "fake-agent".into();
        config.agent_env.insert("KEY".into(), "value".into());
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.agent_command, "fake-agent");
        assert_eq!(loaded.agent_env.get("KEY").map(String::as_str), Some("value"));
    }

    #[test]
    fn parse_env_ignores_garbage() {
        // Unset var → None; the typed parse just falls back.
        assert!(parse_env::<u16>("AGENTCTL_DOES_NOT_EXIST_XYZ").is_none());
    }
}
