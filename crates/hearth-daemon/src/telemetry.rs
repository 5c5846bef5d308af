use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_OTLP_ENDPOINT: &str = "http://127.0.0.1:4317";

#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl TelemetryGuard {
    fn with_tracer() -> Self {
        Self {
            tracer_installed: true,
        }
    }

    fn without_tracer() -> Self {
        Self {
            tracer_installed: false,
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var("HEARTH_OTEL_SAMPLING_RATE").ok().as_deref());

    let mut guard = TelemetryGuard::without_tracer();
    let mut otel_error: Option<anyhow::Error> = None;

    match build_tracer(service_name, sampling_rate) {
        Ok(Some(tracer)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            guard = TelemetryGuard::with_tracer();
        }
        Ok(None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        Err(error) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            otel_error = Some(error);
        }
    }

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }

    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }

    info!(sampling_rate, "telemetry sampling configured");

    Ok(guard)
}

fn build_tracer(service_name: &str, sampling_rate: f64) -> Result<Option<trace::Tracer>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracer))
}

pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    match raw {
        None => (1.0, None),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return (
                    1.0,
                    Some("HEARTH_OTEL_SAMPLING_RATE is empty; defaulting to 1.0".to_string()),
                );
            }

            match trimmed.parse::<f64>() {
                Ok(parsed) => {
                    if (0.0..=1.0).contains(&parsed) {
                        (parsed, None)
                    } else {
                        let clamped = parsed.clamp(0.0, 1.0);
                        (
                            clamped,
                            Some(format!(
                                "HEARTH_OTEL_SAMPLING_RATE={} outside 0.0..=1.0; clamped to {}",
                                trimmed, clamped
                            )),
                        )
                    }
                }
                Err(_) => (
                    1.0,
                    Some(format!(
                        "HEARTH_OTEL_SAMPLING_RATE='{}' is not a valid float; defaulting to 1.0",
                        trimmed
                    )),
                ),
            }
        }
    }
}
