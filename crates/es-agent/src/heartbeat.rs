//! Periodic heartbeat
//!
//! Sends a liveness report with fresh metrics over the plain request path:
//! once at start, then every interval. The interval can be changed while
//! running; the next beat is rescheduled to one new interval from the
//! moment of the change.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use es_core::traits::{ControlPlane, MetricsSampler};
use es_core::{AgentId, HeartbeatReport};

/// Shortest interval accepted by [`HeartbeatService::update_interval`]
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct HeartbeatService {
    agent_id: AgentId,
    control_plane: Arc<dyn ControlPlane>,
    sampler: Arc<dyn MetricsSampler>,
    interval: watch::Sender<Duration>,
}

impl HeartbeatService {
    pub fn new(
        agent_id: AgentId,
        control_plane: Arc<dyn ControlPlane>,
        sampler: Arc<dyn MetricsSampler>,
        interval: Duration,
    ) -> Self {
        let (interval, _) = watch::channel(interval.max(MIN_HEARTBEAT_INTERVAL));
        Self {
            agent_id,
            control_plane,
            sampler,
            interval,
        }
    }

    /// Current period
    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    /// Change the period. Values under one second or equal to the current
    /// period are ignored; returns whether the period changed.
    pub fn update_interval(&self, interval: Duration) -> bool {
        if interval < MIN_HEARTBEAT_INTERVAL {
            tracing::debug!(?interval, "ignoring heartbeat interval below minimum");
            return false;
        }

        let mut previous = interval;
        let changed = self.interval.send_if_modified(|current| {
            if *current == interval {
                return false;
            }
            previous = std::mem::replace(current, interval);
            true
        });
        if changed {
            tracing::info!(from = ?previous, to = ?interval, "heartbeat interval updated");
        }
        changed
    }

    /// Beat until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut changes = self.interval.subscribe();
        tracing::info!(interval = ?self.interval(), "heartbeat started");

        self.beat().await;

        let next = tokio::time::sleep(self.interval());
        tokio::pin!(next);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut next => {
                    self.beat().await;
                    next.as_mut().reset(Instant::now() + self.interval());
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let interval = *changes.borrow_and_update();
                    next.as_mut().reset(Instant::now() + interval);
                }
            }
        }

        tracing::info!("heartbeat stopped");
    }

    async fn beat(&self) {
        let report = HeartbeatReport::new(self.agent_id.clone(), self.sampler.sample());
        match self.control_plane.send_heartbeat(&report).await {
            Ok(()) => tracing::debug!(
                cpu = report.cpu_usage,
                mem = report.mem_usage,
                disk = report.disk_usage,
                "heartbeat sent"
            ),
            Err(e) => tracing::error!(error = %e, "heartbeat failed"),
        }
    }
}
