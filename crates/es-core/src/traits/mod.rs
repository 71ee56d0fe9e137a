//! Collaborator traits consumed by the agent core

mod control_plane;
mod metrics;

pub use control_plane::ControlPlane;
pub use metrics::MetricsSampler;
