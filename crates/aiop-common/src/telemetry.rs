//! Telemetry initialization for logs, traces and metrics
//!
//! JSON structured logs on stdout, filtered by `RUST_LOG` with a default
//! that keeps the operator crates at debug and client stacks quiet. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans and the metrics in
//! [`crate::metrics`] are exported over OTLP as well.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,aiop=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Failed to initialize the OTLP span exporter
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize the OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line (e.g., "aiop-operator")
    pub service_name: String,

    /// Filter directive overriding `RUST_LOG`
    pub filter: Option<String>,

    /// Human-readable output instead of JSON
    pub pretty: bool,

    /// OTLP endpoint for span and metric export (e.g. "http://otel-collector:4317")
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "aiop-operator".to_string(),
            filter: None,
            pretty: false,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
        }
    }
}

impl TelemetryConfig {
    /// Build the filter for this configuration
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| TelemetryError::InvalidFilter(e.to_string())),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Example
///
/// ```ignore
/// use aiop_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::default())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = build_resource(&config.service_name);
            init_otlp_metrics(endpoint, resource.clone())?;
            let provider = init_otlp_tracer(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (json_layer, pretty_layer) = if config.pretty {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    tracing::info!(
        service = %config.service_name,
        otlp = config.otlp_endpoint.is_some(),
        "telemetry initialized"
    );
    Ok(())
}

/// Resource attributes: service identity plus pod details from the downward API
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    for (var, key) in [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ] {
        if let Ok(value) = std::env::var(var) {
            attributes.push(KeyValue::new(key, value));
        }
    }
    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// Periodic push of everything recorded through [`crate::metrics`]
fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader =
        opentelemetry_sdk::metrics::PeriodicReader::builder(exporter, runtime::Tokio).build();
    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    global::set_meter_provider(meter_provider);
    Ok(())
}
