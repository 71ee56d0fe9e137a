//! es-agent: Host agent for EasyShell
//!
//! The agent runs on managed hosts and keeps an outbound WebSocket
//! connection to the control server. Over it the server dispatches shell
//! scripts and opens interactive terminals; results, logs and heartbeats
//! fall back to (or travel over) the plain HTTP API.

pub mod client;
pub mod exec;
pub mod heartbeat;
pub mod metrics;
pub mod pty;
pub mod remote_config;
pub mod state;
pub mod tunnel;

pub use state::AgentState;
