//! Remote configuration polling
//!
//! The control server keeps a flat key/value map per agent. Only the
//! heartbeat period is applied at runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use es_core::{AgentId, ControlPlaneError};

use crate::heartbeat::HeartbeatService;

/// Heartbeat period in seconds
pub const HEARTBEAT_INTERVAL_KEY: &str = "agent.heartbeat.interval";

/// Metrics period in seconds; metrics ride on the heartbeat, so this also
/// sets the heartbeat period and wins when both keys are present
pub const METRICS_INTERVAL_KEY: &str = "agent.metrics.interval";

/// Shortest poll period accepted
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where remote configuration comes from
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    async fn fetch_config(
        &self,
        agent_id: &AgentId,
    ) -> Result<HashMap<String, String>, ControlPlaneError>;
}

/// Apply known keys from `config`; returns whether the heartbeat period
/// changed.
pub fn apply_remote_config(config: &HashMap<String, String>, heartbeat: &HeartbeatService) -> bool {
    let mut changed = false;

    for key in [HEARTBEAT_INTERVAL_KEY, METRICS_INTERVAL_KEY] {
        let Some(raw) = config.get(key) else {
            continue;
        };
        match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => {
                changed |= heartbeat.update_interval(Duration::from_secs(secs));
            }
            _ => tracing::debug!(key, value = %raw, "ignoring invalid interval"),
        }
    }

    changed
}

/// Polls remote configuration on a fixed period
pub struct ConfigPoller {
    agent_id: AgentId,
    source: Arc<dyn RemoteConfigSource>,
    heartbeat: Arc<HeartbeatService>,
    period: Duration,
}

impl ConfigPoller {
    /// `period` is clamped to [`MIN_POLL_INTERVAL`]
    pub fn new(
        agent_id: AgentId,
        source: Arc<dyn RemoteConfigSource>,
        heartbeat: Arc<HeartbeatService>,
        period: Duration,
    ) -> Self {
        Self {
            agent_id,
            source,
            heartbeat,
            period: period.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Fetch once and apply
    pub async fn poll_once(&self) -> Result<bool, ControlPlaneError> {
        let config = self.source.fetch_config(&self.agent_id).await?;
        Ok(apply_remote_config(&config, &self.heartbeat))
    }

    /// Poll immediately, then every period, until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "remote config poll failed");
                    }
                }
            }
        }

        tracing::debug!("config poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es_core::traits::{ControlPlane, MetricsSampler};
    use es_core::{HeartbeatReport, JobResultReport, MetricsSnapshot};
    use std::sync::Mutex;

    struct NullControlPlane;

    #[async_trait]
    impl ControlPlane for NullControlPlane {
        async fn report_result(&self, _: &JobResultReport) -> Result<(), ControlPlaneError> {
            Ok(())
        }

        async fn report_log(&self, _: &str, _: &str) -> Result<(), ControlPlaneError> {
            Ok(())
        }

        async fn send_heartbeat(&self, _: &HeartbeatReport) -> Result<(), ControlPlaneError> {
            Ok(())
        }
    }

    struct IdleSampler;

    impl MetricsSampler for IdleSampler {
        fn sample(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

    struct StaticSource {
        entries: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteConfigSource for StaticSource {
        async fn fetch_config(
            &self,
            agent_id: &AgentId,
        ) -> Result<HashMap<String, String>, ControlPlaneError> {
            self.calls.lock().unwrap().push(agent_id.to_string());
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    fn heartbeat() -> Arc<HeartbeatService> {
        Arc::new(HeartbeatService::new(
            AgentId::from("ag_test"),
            Arc::new(NullControlPlane),
            Arc::new(IdleSampler),
            Duration::from_secs(30),
        ))
    }

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_apply_heartbeat_interval() {
        let hb = heartbeat();
        assert!(apply_remote_config(
            &config(&[(HEARTBEAT_INTERVAL_KEY, "15")]),
            &hb
        ));
        assert_eq!(hb.interval(), Duration::from_secs(15));

        // Same value again is not a change.
        assert!(!apply_remote_config(
            &config(&[(HEARTBEAT_INTERVAL_KEY, "15")]),
            &hb
        ));
    }

    #[test]
    fn test_metrics_interval_wins() {
        let hb = heartbeat();
        apply_remote_config(
            &config(&[(HEARTBEAT_INTERVAL_KEY, "15"), (METRICS_INTERVAL_KEY, "20")]),
            &hb,
        );
        assert_eq!(hb.interval(), Duration::from_secs(20));
    }

    #[test]
    fn test_invalid_values_ignored() {
        let hb = heartbeat();
        for bad in ["", "abc", "0", "-5", "1.5"] {
            assert!(!apply_remote_config(
                &config(&[(HEARTBEAT_INTERVAL_KEY, bad)]),
                &hb
            ));
        }
        assert!(!apply_remote_config(&config(&[("other.key", "5")]), &hb));
        assert_eq!(hb.interval(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_polls_immediately_and_periodically() {
        let hb = heartbeat();
        let source = Arc::new(StaticSource {
            entries: Mutex::new(config(&[(HEARTBEAT_INTERVAL_KEY, "12")])),
            calls: Mutex::new(Vec::new()),
        });
        let poller = Arc::new(ConfigPoller::new(
            AgentId::from("ag_test"),
            source.clone(),
            hb.clone(),
            Duration::from_secs(10),
        ));

        let token = CancellationToken::new();
        let task = {
            let poller = Arc::clone(&poller);
            let stop = token.clone();
            tokio::spawn(async move { poller.run(stop).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls.lock().unwrap().as_slice(), ["ag_test"]);
        assert_eq!(hb.interval(), Duration::from_secs(12));

        source
            .entries
            .lock()
            .unwrap()
            .insert(HEARTBEAT_INTERVAL_KEY.to_string(), "7".to_string());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls.lock().unwrap().len(), 2);
        assert_eq!(hb.interval(), Duration::from_secs(7));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_floored() {
        let source = Arc::new(StaticSource {
            entries: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        });
        let poller = Arc::new(ConfigPoller::new(
            AgentId::from("ag_test"),
            source.clone(),
            heartbeat(),
            Duration::ZERO,
        ));
        assert_eq!(poller.period(), MIN_POLL_INTERVAL);

        let token = CancellationToken::new();
        let task = {
            let poller = Arc::clone(&poller);
            let stop = token.clone();
            tokio::spawn(async move { poller.run(stop).await })
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(source.calls.lock().unwrap().len(), 3);

        token.cancel();
        task.await.unwrap();
    }
}
