//! OpenTelemetry tracing export
//!
//! Spans are exported over OTLP/gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is set;
//! the exporter reads the endpoint from the environment itself.

use opentelemetry::KeyValue;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// Environment variable that switches OTLP export on
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

pub fn otel_enabled() -> bool {
    std::env::var(OTLP_ENDPOINT_ENV).is_ok()
}

/// Build the OpenTelemetry layer, or `None` when export is disabled or the
/// pipeline cannot be installed.
pub fn init_telemetry<S>(service_name: &str) -> Option<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    if !otel_enabled() {
        return None;
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            eprintln!("Failed to initialize OpenTelemetry: {}", e);
            None
        }
    }
}

/// Flush and stop span export
pub fn shutdown_telemetry() {
    if otel_enabled() {
        opentelemetry::global::shutdown_tracer_provider();
    }
}
