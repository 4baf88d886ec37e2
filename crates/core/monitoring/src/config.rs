use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenTelemetryConfig {
    /// Remote OpenTelemetry metrics collector endpoint. Metrics are sent over binary HTTP.
    pub metrics_url: Option<String>,
    /// The interval (in seconds) at which to export metrics to the OpenTelemetry collector.
    ///
    /// Only used when `metrics_url` is provided. If not set, uses the default export interval.
    #[serde(
        default,
        rename = "metrics_export_interval_secs",
        deserialize_with = "deserialize_duration"
    )]
    pub metrics_export_interval: Option<Duration>,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<f64>>::deserialize(deserializer).map(|option| option.map(Duration::from_secs_f64))
}
