//! Core domain types

use es_protocol::JobStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-wide agent identity, stable for the lifetime of the process.
///
/// Used verbatim as the connection path segment and in every fallback report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create a new agent ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an agent ID from a hostname: `ag_` followed by the lowercased
    /// hostname with spaces and dots replaced by dashes.
    pub fn from_hostname(hostname: &str) -> Self {
        let sanitized = hostname.to_lowercase().replace([' ', '.'], "-");
        Self(format!("ag_{}", sanitized))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job result sent over the plain request path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultReport {
    pub job_id: String,
    pub agent_id: AgentId,
    pub status: JobStatus,
    pub exit_code: i32,
    pub output: String,
}

/// One job log line sent over the plain request path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLineReport {
    pub job_id: String,
    pub log: String,
}

/// Point-in-time utilisation, all values in percent (0-100)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
}

/// Periodic liveness report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub agent_id: AgentId,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
}

impl HeartbeatReport {
    pub fn new(agent_id: AgentId, metrics: MetricsSnapshot) -> Self {
        Self {
            agent_id,
            cpu_usage: metrics.cpu_usage,
            mem_usage: metrics.mem_usage,
            disk_usage: metrics.disk_usage,
        }
    }
}

/// Host description sent once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub agent_id: AgentId,
    pub hostname: String,
    pub ip: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub mem_total: u64,
    pub agent_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_from_hostname() {
        assert_eq!(
            AgentId::from_hostname("Build Box.example.com").as_str(),
            "ag_build-box-example-com"
        );
        assert_eq!(AgentId::from_hostname("web01").as_str(), "ag_web01");
    }

    #[test]
    fn test_result_report_wire_shape() {
        let report = JobResultReport {
            job_id: "j1".into(),
            agent_id: AgentId::from("ag_1"),
            status: JobStatus::Success,
            exit_code: 0,
            output: "ok".into(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "jobId": "j1",
                "agentId": "ag_1",
                "status": 2,
                "exitCode": 0,
                "output": "ok",
            })
        );
    }

    #[test]
    fn test_heartbeat_from_snapshot() {
        let snapshot = MetricsSnapshot {
            cpu_usage: 12.5,
            mem_usage: 40.0,
            disk_usage: 71.0,
        };
        let report = HeartbeatReport::new(AgentId::from("ag_x"), snapshot);
        assert_eq!(report.cpu_usage, 12.5);
        assert_eq!(report.disk_usage, 71.0);
    }
}
