//! OTLP span export for the `flowgate` binary.

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const DEFAULT_SERVICE_NAME: &str = "flowgate";

#[derive(Clone, Debug, Default)]
pub struct OtelSettings {
    pub service_name: Option<String>,
    /// OTLP/HTTP endpoint; the exporter's environment defaults apply when unset.
    pub endpoint: Option<String>,
    pub json_logs: bool,
}

/// Flushes pending spans on drop. Keep it alive for the life of the process.
#[derive(Debug)]
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        let _ = self.provider.shutdown();
    }
}

/// Installs the global subscriber: env filter (default `info`), a text or
/// JSON fmt layer, and the OTLP layer. Request spans (`workflow_request`)
/// become exported traces.
pub fn init_tracing(settings: &OtelSettings) -> Result<OtelGuard, Box<dyn std::error::Error>> {
    let service_name = settings
        .service_name
        .clone()
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = settings.endpoint.as_deref() {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(service_name.clone())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name));
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if settings.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(OtelGuard { provider })
}
