//! Job status codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of a job, as the control server numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum JobStatus {
    /// Exit code 0 and no execution error
    Success = 2,
    /// Non-zero exit, spawn failure or deadline exceeded
    Failed = 3,
}

impl JobStatus {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

impl From<JobStatus> for u8 {
    fn from(status: JobStatus) -> Self {
        status.as_u8()
    }
}

impl TryFrom<u8> for JobStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(JobStatus::Success),
            3 => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status code {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Success => f.write_str("success"),
            JobStatus::Failed => f.write_str("failed"),
        }
    }
}
