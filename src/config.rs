//! Agent configuration.
//!
//! Loaded as JSON from a file (`--config`) or from the `MONITOR_AGENT_CONFIG`
//! environment variable, then overridden by `MONITOR_AGENT_ID` and
//! `MONITOR_AGENT_SERVER_ADDRESS`. Missing identity or address is not a load
//! error; the client reports it when it tries to connect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::transport::protocol::AgentType;

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Agent ID assigned by the control plane at registration.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub ports: PortsConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub process: ProcessConfig,
}

/// Control plane address and credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// `host:port` of the control plane.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl ServerConfig {
    /// Opaque credentials forwarded in the connect request.
    pub fn credentials(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some(format!("{user}:{password}")),
            (Some(user), None) => Some(user.clone()),
            _ => None,
        }
    }
}

/// Locations of external binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Exporter binaries by sub-agent type. Types not listed fall back to
    /// `<exporters_base>/<type>`.
    #[serde(default)]
    pub exporters: HashMap<AgentType, PathBuf>,

    #[serde(default = "default_exporters_base")]
    pub exporters_base: PathBuf,

    #[serde(default = "default_tools_base")]
    pub tools_base: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            exporters: HashMap::new(),
            exporters_base: default_exporters_base(),
            tools_base: default_tools_base(),
        }
    }
}

impl PathsConfig {
    pub fn exporter(&self, agent_type: AgentType) -> PathBuf {
        self.exporters
            .get(&agent_type)
            .cloned()
            .unwrap_or_else(|| self.exporters_base.join(agent_type.to_string()))
    }

    pub fn tool(&self, name: &str) -> PathBuf {
        self.tools_base.join(name)
    }
}

/// Range sub-agent listen ports are reserved from.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

/// Dial and handshake timing.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_backoff_min")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            backoff_min_ms: default_backoff_min(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl ConnectionConfig {
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub const fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub const fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Fallback timeouts for Actions and Jobs whose request carries none.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_action_timeout")]
    pub action_timeout_seconds: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            action_timeout_seconds: default_action_timeout(),
            job_timeout_seconds: default_job_timeout(),
        }
    }
}

impl RunnerConfig {
    pub const fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_seconds)
    }

    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }
}

/// Sub-agent process timing and log capture.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProcessConfig {
    /// How long a fresh process must survive to count as running.
    #[serde(default = "default_startup_window")]
    pub startup_window_ms: u64,
    /// Grace period between SIGTERM and kill.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
    /// Lines of output kept per sub-agent.
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            startup_window_ms: default_startup_window(),
            stop_grace_ms: default_stop_grace(),
            log_lines: default_log_lines(),
        }
    }
}

impl ProcessConfig {
    pub const fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Config {
    /// Load configuration from the `MONITOR_AGENT_CONFIG` environment variable.
    pub fn from_env() -> Result<Self> {
        let json = std::env::var("MONITOR_AGENT_CONFIG")
            .context("MONITOR_AGENT_CONFIG not set and no --config given")?;
        let mut config = Self::from_json(&json).context("Failed to parse MONITOR_AGENT_CONFIG")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("MONITOR_AGENT_ID") {
            debug!("Agent ID overridden from environment");
            self.id = Some(id);
        }
        if let Ok(address) = std::env::var("MONITOR_AGENT_SERVER_ADDRESS") {
            debug!(%address, "Server address overridden from environment");
            self.server.address = Some(address);
        }
    }

    /// Agent ID, if configured and non-empty.
    pub fn agent_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|s| !s.is_empty())
    }

    /// Server address, if configured and non-empty.
    pub fn server_address(&self) -> Option<&str> {
        self.server.address.as_deref().filter(|s| !s.is_empty())
    }
}

fn default_exporters_base() -> PathBuf {
    "/usr/local/monitor-agent/exporters".into()
}

fn default_tools_base() -> PathBuf {
    "/usr/local/monitor-agent/tools".into()
}

const fn default_port_min() -> u16 {
    42000
}

const fn default_port_max() -> u16 {
    51999
}

const fn default_dial_timeout() -> u64 {
    5_000
}

const fn default_ping_timeout() -> u64 {
    10_000
}

const fn default_backoff_min() -> u64 {
    1_000
}

const fn default_backoff_max() -> u64 {
    15_000
}

const fn default_action_timeout() -> u64 {
    10
}

const fn default_job_timeout() -> u64 {
    3600
}

const fn default_startup_window() -> u64 {
    1_000
}

const fn default_stop_grace() -> u64 {
    5_000
}

const fn default_log_lines() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let config = Config::from_json("{}").unwrap();

        assert!(config.agent_id().is_none());
        assert!(config.server_address().is_none());
        assert_eq!(config.ports.min, 42000);
        assert_eq!(config.ports.max, 51999);
        assert_eq!(config.connection.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.backoff_min(), Duration::from_secs(1));
        assert_eq!(config.connection.backoff_max(), Duration::from_secs(15));
        assert_eq!(config.runner.action_timeout(), Duration::from_secs(10));
        assert_eq!(config.process.startup_window(), Duration::from_secs(1));
        assert_eq!(config.process.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.process.log_lines, 100);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "id": "/agent_id/abc",
            "server": {
                "address": "127.0.0.1:8443",
                "username": "admin",
                "password": "secret"
            },
            "paths": {
                "exporters": {"node_exporter": "/opt/bin/node_exporter"},
                "tools_base": "/opt/tools"
            },
            "ports": {"min": 30000, "max": 30010},
            "connection": {"dial_timeout_ms": 100}
        }"#;

        let config = Config::from_json(json).unwrap();

        assert_eq!(config.agent_id(), Some("/agent_id/abc"));
        assert_eq!(config.server_address(), Some("127.0.0.1:8443"));
        assert_eq!(config.server.credentials().as_deref(), Some("admin:secret"));
        assert_eq!(
            config.paths.exporter(AgentType::NodeExporter),
            PathBuf::from("/opt/bin/node_exporter")
        );
        assert_eq!(
            config.paths.exporter(AgentType::MysqldExporter),
            PathBuf::from("/usr/local/monitor-agent/exporters/mysqld_exporter")
        );
        assert_eq!(config.paths.tool("pt-summary"), PathBuf::from("/opt/tools/pt-summary"));
        assert_eq!(config.ports.min, 30000);
        assert_eq!(config.connection.dial_timeout(), Duration::from_millis(100));
        // Untouched fields keep their defaults
        assert_eq!(config.connection.ping_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn empty_strings_count_as_missing() {
        let config = Config::from_json(r#"{"id": "", "server": {"address": ""}}"#).unwrap();
        assert!(config.agent_id().is_none());
        assert!(config.server_address().is_none());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"server": {"address": "cp:443"}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.server.address.is_some());
    }

    #[test]
    fn load_from_missing_file_fails() {
        let err = Config::from_file(Path::new("/nonexistent/agent.json")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }

    #[test]
    fn credentials_without_username() {
        let server = ServerConfig {
            address: None,
            username: None,
            password: Some("x".to_string()),
        };
        assert!(server.credentials().is_none());
    }
}
