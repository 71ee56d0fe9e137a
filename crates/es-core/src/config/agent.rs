//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::AgentId;

/// Configuration for the host agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control server base address, `http://` or `https://`.
    ///
    /// The duplex connection uses the same host with the scheme rewritten
    /// to `ws://` or `wss://`.
    pub server_url: String,

    /// Agent identity (derived from the hostname when unset)
    pub agent_id: Option<String>,

    /// Heartbeat period
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// How often remote configuration is polled
    #[serde(with = "duration_secs")]
    pub config_poll_interval: Duration,

    /// Delay between a dropped connection and the next dial
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Protocol ping period on an open connection
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Deadline for jobs that do not carry their own timeout
    #[serde(with = "duration_secs")]
    pub default_job_timeout: Duration,

    /// Shell spawned for interactive terminals
    pub default_shell: Option<String>,

    /// Environment variables for interactive terminals
    pub default_env: Vec<(String, String)>,

    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            agent_id: None,
            heartbeat_interval: Duration::from_secs(30),
            config_poll_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            default_job_timeout: Duration::from_secs(600),
            default_shell: None,
            default_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Resolve the agent ID, falling back to one derived from `hostname`
    pub fn resolve_agent_id(&self, hostname: &str) -> AgentId {
        match self.agent_id.as_deref() {
            Some(id) if !id.trim().is_empty() => AgentId::new(id.trim()),
            _ => AgentId::from_hostname(hostname),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.server_url, "http://localhost:8080");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(config
            .default_env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm-256color"));
    }

    #[test]
    fn test_resolve_agent_id() {
        let mut config = AgentConfig::default();
        assert_eq!(config.resolve_agent_id("Host.Local").as_str(), "ag_host-local");

        config.agent_id = Some("ag_pinned".into());
        assert_eq!(config.resolve_agent_id("Host.Local").as_str(), "ag_pinned");

        config.agent_id = Some("   ".into());
        assert_eq!(config.resolve_agent_id("h").as_str(), "ag_h");
    }
}
