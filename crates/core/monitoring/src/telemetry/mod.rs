pub mod metrics;

pub use opentelemetry_otlp::ExporterBuildError;
