use std::{borrow::Cow, time::Duration};

pub use opentelemetry::{KeyValue, metrics::Meter};
use opentelemetry_otlp::{ExporterBuildError, Protocol, WithExportConfig};
pub use opentelemetry_sdk::metrics::SdkMeterProvider;

pub const DEFAULT_METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(60);

pub type Result = std::result::Result<(SdkMeterProvider, Meter), ExporterBuildError>;

const INGEST_METER: &str = "ingest-meter";

/// Starts a periodic OpenTelemetry metrics exporter over binary HTTP transport.
pub fn start(url: String, export_interval: Option<Duration>) -> Result {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(url)
        .build()?;
    // If not set, use the default periodic exporter value.
    let export_interval = export_interval.unwrap_or(DEFAULT_METRICS_EXPORT_INTERVAL);
    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(export_interval)
        .build();

    let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();
    opentelemetry::global::set_meter_provider(meter_provider.clone());
    let meter = opentelemetry::global::meter(INGEST_METER);

    Ok((meter_provider, meter))
}

/// An OpenTelemetry histogram.
#[derive(Debug, Clone)]
pub struct Histogram<T>(opentelemetry::metrics::Histogram<T>);

impl<T> Histogram<T> {
    /// Record a new observation point with additional key-value pairs.
    pub fn record_with_kvs(&self, value: T, kv_pairs: &[KeyValue]) {
        self.0.record(value, kv_pairs);
    }

    /// Record a new observation point.
    pub fn record(&self, value: T) {
        self.record_with_kvs(value, &[]);
    }
}

impl Histogram<f64> {
    /// Create a new f64 OpenTelemetry histogram.
    pub fn new_f64(
        meter: &Meter,
        name: impl Into<Cow<'static, str>>,
        description: impl Into<Cow<'static, str>>,
        unit: impl Into<Cow<'static, str>>,
    ) -> Self {
        let inner = meter
            .f64_histogram(name)
            .with_description(description)
            .with_unit(unit)
            .build();

        Self(inner)
    }
}

/// An OpenTelemetry counter.
#[derive(Debug, Clone)]
pub struct Counter(opentelemetry::metrics::Counter<u64>);

impl Counter {
    /// Create a new OpenTelemetry counter.
    pub fn new(
        meter: &Meter,
        name: impl Into<Cow<'static, str>>,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        let inner = meter
            .u64_counter(name)
            .with_description(description)
            .build();

        Self(inner)
    }

    /// Increment the OpenTelemetry counter by the given amount with additional key-value pairs.
    pub fn inc_by_with_kvs(&self, value: u64, kv_pairs: &[KeyValue]) {
        self.0.add(value, kv_pairs);
    }

    /// Increment the OpenTelemetry counter by one with additional key-value pairs.
    pub fn inc_with_kvs(&self, kv_pairs: &[KeyValue]) {
        self.inc_by_with_kvs(1, kv_pairs);
    }
}

/// Flushes the OpenTelemetry metrics provider and shuts it down, so that metrics recorded since
/// the last periodic export are not lost on exit.
pub fn provider_flush_shutdown(
    provider: SdkMeterProvider,
) -> std::result::Result<(), opentelemetry_sdk::error::OTelSdkError> {
    provider.force_flush()?;
    provider.shutdown()
}
