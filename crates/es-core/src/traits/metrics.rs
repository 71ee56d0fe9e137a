//! Host metrics sampling

use crate::types::MetricsSnapshot;

/// Samples current host utilisation
pub trait MetricsSampler: Send + Sync {
    fn sample(&self) -> MetricsSnapshot;
}
