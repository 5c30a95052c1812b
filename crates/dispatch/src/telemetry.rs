//! Logging and trace export for inventory workers
//!
//! [`init_telemetry`] installs a `tracing` subscriber with a filtered console
//! layer and, when an OTLP endpoint is configured, a span exporter. Spans
//! exported this way supply the trace ids written into ledger records.

use std::time::Duration;

use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider, Tracer};
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SERVICE_NAME: &str = "inventory-dispatch";
const DEFAULT_LOG_FILTER: &str = "info";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP gRPC collector, e.g. `http://localhost:4317`; export is off without it
    pub otlp_endpoint: Option<String>,
    /// `deployment.environment` resource attribute
    pub environment: Option<String>,
    /// Facility the worker collects for, attached to every exported span
    pub facility: Option<String>,
    pub enable_console: bool,
    /// `EnvFilter` directives, e.g. `inventory_dispatch=debug`
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            facility: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Read `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_ENVIRONMENT`, `FACILITY_CODE` and
    /// `RUST_LOG` (falling back to `LOG_LEVEL`)
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: lookup("OTEL_SERVICE_VERSION"),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.trim().is_empty()),
            environment: lookup("OTEL_ENVIRONMENT"),
            facility: lookup("FACILITY_CODE"),
            enable_console: defaults.enable_console,
            log_filter: lookup("RUST_LOG").or_else(|| lookup("LOG_LEVEL")),
        }
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = Some(facility.into());
        self
    }

    fn resource(&self) -> Resource {
        let optional = [
            ("service.version", &self.service_version),
            ("deployment.environment", &self.environment),
            ("inventory.facility", &self.facility),
        ];
        let attributes = std::iter::once(KeyValue::new("service.name", self.service_name.clone()))
            .chain(
                optional
                    .into_iter()
                    .filter_map(|(key, value)| value.clone().map(|v| KeyValue::new(key, v))),
            );
        Resource::builder().with_attributes(attributes).build()
    }

    // Invalid directives fall back to the default rather than disabling logs.
    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Flushes and shuts down span export when dropped
///
/// Hold it for the lifetime of the worker.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("span exporter shutdown failed: {e:?}");
            }
        }
    }
}

/// Install the global subscriber; call once per process
///
/// An exporter that cannot be built is reported through the freshly
/// installed console layer and the worker continues without export.
///
/// ```ignore
/// use inventory_dispatch::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _telemetry = init_telemetry(TelemetryConfig::from_env());
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console = config
        .enable_console
        .then(|| tracing_subscriber::fmt::layer().with_target(true).with_filter(config.env_filter()));

    let export = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| (endpoint, span_exporter(endpoint, config.resource())));

    let (provider, otel) = match &export {
        Some((_, Ok((provider, tracer)))) => (
            Some(provider.clone()),
            Some(tracing_opentelemetry::layer().with_tracer(tracer.clone())),
        ),
        _ => (None, None),
    };

    tracing_subscriber::registry().with(console).with(otel).init();

    match export {
        Some((endpoint, Ok(_))) => tracing::info!(endpoint, "span export enabled"),
        Some((endpoint, Err(e))) => {
            tracing::warn!(endpoint, error = %e, "span exporter unavailable, continuing without export")
        }
        None => tracing::debug!("span export disabled, no OTLP endpoint configured"),
    }

    TelemetryGuard { provider }
}

fn span_exporter(
    endpoint: &str,
    resource: Resource,
) -> Result<(SdkTracerProvider, Tracer), opentelemetry::trace::TraceError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();
    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);

    Ok((provider, tracer))
}

/// Trace and span identifiers carried into ledger records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Parse a W3C `traceparent` header (`00-{trace-id}-{span-id}-{flags}`)
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let _version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let _flags = parts.next()?;

        let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
        if trace_id.len() != 32 || span_id.len() != 16 || !is_hex(trace_id) || !is_hex(span_id) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
        })
    }
}

/// Trace context of the current `tracing` span, when it is exported
///
/// Returns `None` when no OpenTelemetry layer is installed or the span is
/// not sampled into a valid context.
pub fn current_trace_context() -> Option<TraceContext> {
    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        return None;
    }

    Some(TraceContext {
        trace_id: span_context.trace_id().to_string(),
        span_id: span_context.span_id().to_string(),
    })
}
