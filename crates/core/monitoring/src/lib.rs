use opentelemetry::metrics::Meter;

pub mod config;
pub mod logging;
pub mod telemetry;

use self::{
    config::OpenTelemetryConfig,
    telemetry::metrics::{self, SdkMeterProvider},
};

/// Return type for the `init` function.
///
/// The provider is an RAII guard that must be kept alive (and ideally flushed with
/// [`metrics::provider_flush_shutdown`]) for as long as metrics should be exported. Both are
/// `None` when metrics are disabled.
pub type TelemetryKit = (Option<SdkMeterProvider>, Option<Meter>);

/// Initializes logging and, if a metrics collector is configured, the metrics exporter.
pub fn init(
    config: Option<&OpenTelemetryConfig>,
) -> Result<TelemetryKit, telemetry::ExporterBuildError> {
    logging::init();

    let Some(url) = config.and_then(|config| config.metrics_url.as_deref()) else {
        return Ok((None, None));
    };

    let export_interval = config.and_then(|config| config.metrics_export_interval);
    let (provider, meter) = metrics::start(url.to_string(), export_interval)?;
    tracing::info!(url, "exporting metrics");

    Ok((Some(provider), Some(meter)))
}
