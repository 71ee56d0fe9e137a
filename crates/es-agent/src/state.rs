//! Agent state management

use std::sync::Arc;

use es_core::config::AgentConfig;
use es_core::traits::{ControlPlane, MetricsSampler};
use es_core::{AgentError, AgentId};

use crate::client::ControlPlaneClient;
use crate::exec::JobExecutor;
use crate::heartbeat::HeartbeatService;
use crate::metrics::SystemSampler;
use crate::pty::{SessionMultiplexer, ShellSpec};
use crate::remote_config::ConfigPoller;
use crate::tunnel::{ConnectionManager, Outbound, PushChannel};

/// Long-lived components of a running agent, wired together
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    pub agent_id: AgentId,
    /// Plain request path
    pub client: Arc<ControlPlaneClient>,
    /// Write half of the duplex connection, shared by all producers
    pub outbound: Arc<Outbound>,
    /// Live terminal sessions
    pub sessions: Arc<SessionMultiplexer>,
    pub executor: Arc<JobExecutor>,
    pub heartbeat: Arc<HeartbeatService>,
}

impl AgentState {
    /// Create new agent state
    pub fn new(config: AgentConfig, agent_id: AgentId) -> Result<Self, AgentError> {
        let client = Arc::new(ControlPlaneClient::new(&config.server_url)?);
        let outbound = Arc::new(Outbound::new());

        let shell = ShellSpec::resolve(config.default_shell.as_deref(), config.default_env.clone());
        let sessions = Arc::new(SessionMultiplexer::new(shell));

        let executor = Arc::new(
            JobExecutor::new(
                agent_id.clone(),
                outbound.clone() as Arc<dyn PushChannel>,
                client.clone() as Arc<dyn ControlPlane>,
            )
            .with_default_timeout(config.default_job_timeout),
        );

        let heartbeat = Arc::new(HeartbeatService::new(
            agent_id.clone(),
            client.clone(),
            Arc::new(SystemSampler::new()) as Arc<dyn MetricsSampler>,
            config.heartbeat_interval,
        ));

        Ok(Self {
            config,
            agent_id,
            client,
            outbound,
            sessions,
            executor,
            heartbeat,
        })
    }

    /// Connection manager dialing the configured server
    pub fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(
            &self.config.server_url,
            &self.agent_id,
            Arc::clone(&self.outbound),
            Arc::clone(&self.sessions),
            Arc::clone(&self.executor),
        )
        .with_reconnect_delay(self.config.reconnect_delay)
        .with_keepalive_interval(self.config.keepalive_interval)
    }

    /// Remote config poller feeding the heartbeat
    pub fn config_poller(&self) -> ConfigPoller {
        ConfigPoller::new(
            self.agent_id.clone(),
            self.client.clone(),
            Arc::clone(&self.heartbeat),
            self.config.config_poll_interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wiring_follows_config() {
        let config = AgentConfig {
            server_url: "https://control.example.com/".into(),
            heartbeat_interval: Duration::from_secs(45),
            ..AgentConfig::default()
        };
        let state = AgentState::new(config, AgentId::from("ag_web01")).unwrap();

        assert_eq!(state.client.base_url(), "https://control.example.com");
        assert_eq!(state.heartbeat.interval(), Duration::from_secs(45));
        assert!(state.sessions.is_empty());
        assert!(!state.outbound.is_connected().await);
        assert_eq!(
            state.connection_manager().url(),
            "wss://control.example.com/ws/agent/ag_web01"
        );
    }

    #[tokio::test]
    async fn test_zero_periods_from_config_are_floored() {
        let config: AgentConfig =
            toml::from_str("config_poll_interval = 0\nkeepalive_interval = 0").unwrap();
        assert_eq!(config.keepalive_interval, Duration::ZERO);

        let state = AgentState::new(config, AgentId::from("ag_web01")).unwrap();
        assert_eq!(
            state.connection_manager().keepalive_interval(),
            crate::tunnel::MIN_KEEPALIVE_INTERVAL
        );
        assert_eq!(
            state.config_poller().period(),
            crate::remote_config::MIN_POLL_INTERVAL
        );
    }
}
