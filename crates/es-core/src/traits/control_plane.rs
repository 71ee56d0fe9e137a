//! Plain request/response control plane

use async_trait::async_trait;

use crate::error::ControlPlaneError;
use crate::types::{HeartbeatReport, JobResultReport};

/// The plain request path to the control server.
///
/// This is the fallback channel for job results and log lines when the
/// duplex connection is unavailable, and the only channel for heartbeats.
/// Callers log failures and do not retry.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Report the final outcome of a job
    async fn report_result(&self, report: &JobResultReport) -> Result<(), ControlPlaneError>;

    /// Report one streamed output line of a job
    async fn report_log(&self, job_id: &str, line: &str) -> Result<(), ControlPlaneError>;

    /// Report current host metrics
    async fn send_heartbeat(&self, report: &HeartbeatReport) -> Result<(), ControlPlaneError>;
}
