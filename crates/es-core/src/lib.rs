//! es-core: Core abstractions and configuration for the EasyShell agent
//!
//! This crate provides the identity and report types, the collaborator
//! traits the agent core depends on, the error taxonomy, and the on-disk
//! configuration format.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{AgentError, ConfigError, ConnectionError, ControlPlaneError, SessionError};
pub use types::{AgentId, HeartbeatReport, JobResultReport, LogLineReport, MetricsSnapshot};
