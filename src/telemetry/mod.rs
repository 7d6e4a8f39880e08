//! Tracing subscriber and OpenTelemetry export.
//!
//! Logs always go to stderr through the fmt layer. When an OTLP endpoint is
//! configured, spans, queue metrics and log records are also exported, all
//! tagged with a resource naming the service and the queues it serves.
//! Without an endpoint every metric instrument is a no-op.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Resource attribute listing the queues this process works on.
pub const QUEUES_ATTRIBUTE: &str = "ordq.queues";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317".
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub queues: Vec<String>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            log_level: "info".to_string(),
            queues: Vec::new(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            log_level: config.log_level.clone(),
            ..Self::new("ordq")
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    /// Resource attached to every exported signal.
    pub fn resource(&self) -> Resource {
        use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;

        let mut builder = Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")));
        if !self.queues.is_empty() {
            builder = builder.with_attribute(KeyValue::new(QUEUES_ATTRIBUTE, self.queues.join(",")));
        }
        builder.build()
    }
}

/// The three OTLP providers. Metrics are also installed globally so the
/// instruments in [`metrics`] pick them up.
struct Pipelines {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    logger_provider: SdkLoggerProvider,
}

impl Pipelines {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig as _};

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("OTLP span exporter: {e}")))?;
        let metrics = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("OTLP metric exporter: {e}")))?;
        let logs = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("OTLP log exporter: {e}")))?;

        let pipelines = Self {
            tracer_provider: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter_provider: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger_provider: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        };
        opentelemetry::global::set_meter_provider(pipelines.meter_provider.clone());
        Ok(pipelines)
    }
}

/// Flushes and shuts down the exporters when dropped. Hold it for the life
/// of the process.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// True when signals are being exported.
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }

    /// Push everything buffered so far to the collector.
    pub fn force_flush(&self) {
        if let Some(p) = &self.pipelines {
            let _ = p.tracer_provider.force_flush();
            let _ = p.meter_provider.force_flush();
            let _ = p.logger_provider.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first so records emitted while spans close still go out.
        if let Some(p) = self.pipelines.take() {
            let _ = p.logger_provider.shutdown();
            let _ = p.meter_provider.shutdown();
            let _ = p.tracer_provider.shutdown();
        }
    }
}

/// Install the global subscriber and, if an endpoint is set, the exporters.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let pipelines = config
        .endpoint
        .as_deref()
        .map(|endpoint| Pipelines::build(endpoint, config.resource()))
        .transpose()?;

    let trace_layer = pipelines.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer_provider.tracer("ordq"))
    });
    let log_layer = pipelines
        .as_ref()
        .map(|p| OpenTelemetryTracingBridge::new(&p.logger_provider));
    // The collector keeps full detail, so stderr stays terse while exporting.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(pipelines.is_none());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { pipelines })
}
