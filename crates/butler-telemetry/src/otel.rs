use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::info;

static INSTALL_GUARD: OnceLock<bool> = OnceLock::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the OTel tracer + meter providers for this process.
///
/// Installed at most once per process: the second butler daemon hosted in the
/// same process reuses the first installation and this call becomes a no-op
/// that still leaves `global::meter(...)` usable. When
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is unset nothing is installed and all
/// returned meters are no-op.
pub fn init_telemetry(service_name: &str) -> bool {
    let service = service_name.to_string();
    *INSTALL_GUARD.get_or_init(|| {
        let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT unset; telemetry providers not installed");
            return false;
        };
        if endpoint.is_empty() {
            return false;
        }

        let resource = Resource::builder()
            .with_attributes([KeyValue::new("service.name", service.clone())])
            .build();

        let span_exporter = match SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build()
        {
            Ok(exporter) => exporter,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build OTLP span exporter");
                return false;
            }
        };
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(resource.clone())
            .build();
        let _ = TRACER_PROVIDER.set(tracer_provider.clone());
        global::set_tracer_provider(tracer_provider);

        let metric_exporter = match MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
        {
            Ok(exporter) => exporter,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build OTLP metric exporter");
                return false;
            }
        };
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metric_exporter).build())
            .with_resource(resource)
            .build();
        global::set_meter_provider(meter_provider);

        info!(service = %service, "OTel providers installed");
        INSTALLED.store(true, Ordering::Release);
        true
    })
}

/// Whether a real (non-noop) telemetry pipeline is active.
pub fn telemetry_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Bridge `tracing` spans into the installed OTel pipeline.
///
/// Returns `None` in no-op mode so callers can skip the layer entirely.
pub fn tracing_layer<S>() -> Option<tracing_opentelemetry::OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    use opentelemetry::trace::TracerProvider as _;
    TRACER_PROVIDER
        .get()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("butlers")))
}
