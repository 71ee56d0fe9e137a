//! Shared serialization/deserialization utilities for configuration

/// Serializes `std::time::Duration` as whole seconds, which reads better in
/// TOML than a nested `{secs, nanos}` table.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "es_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
