//! OpenTelemetry provider bootstrap.
//!
//! Builds OTLP exporters for traces and metrics, registers the providers and
//! the W3C trace-context propagator process-wide, and hands back a
//! [`TelemetryHandle`] that owns their teardown.

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{Compression, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};

use crate::config::{ExportCompression, ExportProtocol};

/// Instrumentation scope for everything this service emits.
pub const INSTRUMENTATION_NAME: &str = "speedtest-webhook";

/// Set once the first bootstrap has claimed the process-wide providers.
static BOOTSTRAPPED: OnceLock<()> = OnceLock::new();

/// Exporter settings, resolved from [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Collector base URL, without a trailing slash.
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub protocol: ExportProtocol,
    pub compression: ExportCompression,
    /// Timeout for a single export call.
    pub timeout: Duration,
    pub metric_export_interval: Duration,
    pub service_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry providers are already initialized in this process")]
    AlreadyInitialized,

    #[error("invalid telemetry configuration: {0}")]
    Config(String),

    #[error("failed to build trace pipeline: {0}")]
    Trace(#[from] opentelemetry::trace::TraceError),

    #[error("failed to build metrics pipeline: {0}")]
    Metrics(#[from] opentelemetry::metrics::MetricsError),

    #[error("telemetry shutdown failed: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    #[error("telemetry flush did not finish within {0:?}")]
    FlushTimeout(Duration),
}

/// A provider that can be flushed and shut down.
pub trait ProviderShutdown: Send {
    fn name(&self) -> &'static str;

    /// Flush buffered telemetry and release exporter resources.
    fn shutdown(&self) -> Result<(), String>;
}

impl ProviderShutdown for TracerProvider {
    fn name(&self) -> &'static str {
        "tracer provider"
    }

    fn shutdown(&self) -> Result<(), String> {
        TracerProvider::shutdown(self).map_err(|e| e.to_string())
    }
}

impl ProviderShutdown for SdkMeterProvider {
    fn name(&self) -> &'static str {
        "meter provider"
    }

    fn shutdown(&self) -> Result<(), String> {
        SdkMeterProvider::shutdown(self).map_err(|e| e.to_string())
    }
}

/// Runs provider teardown exactly once.
///
/// Every provider is shut down even when an earlier one fails; all failures
/// are reported together.
pub struct Teardown {
    providers: Mutex<Option<Vec<Box<dyn ProviderShutdown>>>>,
}

impl Teardown {
    pub fn new(providers: Vec<Box<dyn ProviderShutdown>>) -> Self {
        Self {
            providers: Mutex::new(Some(providers)),
        }
    }

    /// Shut every provider down, giving up after `timeout`.
    ///
    /// Calls after the first return `Ok(())` without doing anything.
    pub async fn run(&self, timeout: Duration) -> Result<(), TelemetryError> {
        let Some(providers) = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        // SDK shutdown blocks on exporter I/O. Runs on a detached thread since
        // runtime shutdown waits for blocking-pool tasks, and a hung exporter
        // must not hold the process past `timeout`.
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("telemetry-teardown".into())
            .spawn(move || {
                let errors = providers
                    .iter()
                    .filter_map(|provider| {
                        provider
                            .shutdown()
                            .err()
                            .map(|e| format!("{}: {e}", provider.name()))
                    })
                    .collect::<Vec<_>>();
                let _ = tx.send(errors);
            })
            .map_err(|e| {
                TelemetryError::Shutdown(vec![format!("failed to start teardown thread: {e}")])
            })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(errors)) if errors.is_empty() => Ok(()),
            Ok(Ok(errors)) => Err(TelemetryError::Shutdown(errors)),
            Ok(Err(_)) => Err(TelemetryError::Shutdown(vec![
                "teardown thread exited without reporting".into(),
            ])),
            Err(_) => Err(TelemetryError::FlushTimeout(timeout)),
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .providers
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false);
        f.debug_struct("Teardown").field("pending", &pending).finish()
    }
}

/// Process-wide telemetry providers.
#[derive(Debug)]
pub struct TelemetryHandle {
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    teardown: Teardown,
}

impl TelemetryHandle {
    /// Tracer for spans emitted by this service.
    pub fn tracer(&self) -> Tracer {
        self.tracer_provider.tracer(INSTRUMENTATION_NAME)
    }

    /// Meter for instruments owned by this service.
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(INSTRUMENTATION_NAME)
    }

    /// Flush and release both providers. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TelemetryError> {
        tracing::info!("Flushing telemetry");
        self.teardown.run(timeout).await
    }
}

/// Build the OTLP providers and register them globally.
///
/// Must run inside a Tokio runtime; the batch span processor and the periodic
/// metric reader spawn their workers on it.
///
/// # Arguments
///
/// * `config` - Collector endpoint, headers, protocol and export timings
///
/// # Returns
///
/// A handle owning both providers. Call [`TelemetryHandle::shutdown`] before
/// exit to flush buffered spans and metrics.
///
/// # Errors
///
/// [`TelemetryError::AlreadyInitialized`] on a second call in the same
/// process, [`TelemetryError::Config`] for settings the exporters cannot
/// honor, and the SDK's pipeline errors.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryHandle, TelemetryError> {
    check_config(config)?;
    if BOOTSTRAPPED.set(()).is_err() {
        return Err(TelemetryError::AlreadyInitialized);
    }

    tracing::info!(
        endpoint = %config.endpoint,
        protocol = ?config.protocol,
        compression = ?config.compression,
        service_name = %config.service_name,
        "Initializing OpenTelemetry"
    );

    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let tracer_provider = build_tracer_provider(config, resource.clone())?;
    let meter_provider = match build_meter_provider(config, resource) {
        Ok(provider) => provider,
        Err(e) => {
            if let Err(shutdown_err) = tracer_provider.shutdown() {
                tracing::warn!(error = %shutdown_err, "Failed to release tracer provider");
            }
            return Err(e);
        }
    };

    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    tracing::info!("OpenTelemetry initialized");

    let teardown = Teardown::new(vec![
        Box::new(tracer_provider.clone()),
        Box::new(meter_provider.clone()),
    ]);

    Ok(TelemetryHandle {
        tracer_provider,
        meter_provider,
        teardown,
    })
}

/// Reject settings the exporters cannot honor.
pub fn check_config(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if config.service_name.trim().is_empty() {
        return Err(TelemetryError::Config("service name is empty".into()));
    }
    if config.protocol == ExportProtocol::HttpProtobuf
        && config.compression == ExportCompression::Gzip
    {
        return Err(TelemetryError::Config(
            "gzip compression is only supported with the grpc protocol".into(),
        ));
    }
    if config.protocol == ExportProtocol::Grpc {
        metadata(&config.headers)?;
    }
    Ok(())
}

fn metadata(headers: &[(String, String)]) -> Result<MetadataMap, TelemetryError> {
    let mut map = MetadataMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = MetadataKey::from_bytes(name.as_bytes())
            .map_err(|_| TelemetryError::Config(format!("invalid header name {name:?}")))?;
        let value = MetadataValue::try_from(value.as_str())
            .map_err(|_| TelemetryError::Config(format!("invalid value for header {name}")))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn grpc_exporter(
    config: &TelemetryConfig,
) -> Result<opentelemetry_otlp::TonicExporterBuilder, TelemetryError> {
    let mut exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(config.endpoint.clone())
        .with_timeout(config.timeout)
        .with_metadata(metadata(&config.headers)?);
    if config.compression == ExportCompression::Gzip {
        exporter = exporter.with_compression(Compression::Gzip);
    }
    Ok(exporter)
}

fn http_exporter(
    config: &TelemetryConfig,
    signal_path: &str,
) -> opentelemetry_otlp::HttpExporterBuilder {
    let headers: HashMap<String, String> = config.headers.iter().cloned().collect();
    opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(format!("{}{signal_path}", config.endpoint))
        .with_timeout(config.timeout)
        .with_headers(headers)
}

fn build_tracer_provider(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    let pipeline = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(sdktrace::Config::default().with_resource(resource));

    let provider = match config.protocol {
        ExportProtocol::Grpc => pipeline
            .with_exporter(grpc_exporter(config)?)
            .install_batch(runtime::Tokio)?,
        ExportProtocol::HttpProtobuf => pipeline
            .with_exporter(http_exporter(config, "/v1/traces"))
            .install_batch(runtime::Tokio)?,
    };
    Ok(provider)
}

fn build_meter_provider(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<SdkMeterProvider, TelemetryError> {
    let pipeline = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_period(config.metric_export_interval)
        .with_timeout(config.timeout)
        .with_resource(resource);

    let provider = match config.protocol {
        ExportProtocol::Grpc => pipeline.with_exporter(grpc_exporter(config)?).build()?,
        ExportProtocol::HttpProtobuf => pipeline
            .with_exporter(http_exporter(config, "/v1/metrics"))
            .build()?,
    };
    Ok(provider)
}
