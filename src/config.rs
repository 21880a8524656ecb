//! Configuration parsing for the webhook server.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides (standard `OTEL_*` names for the exporter)
//! - Defaults for everything except the listen port and exporter endpoint

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

use crate::observability::telemetry::TelemetryConfig;

/// Default service name reported as the `service.name` resource attribute.
pub const DEFAULT_SERVICE_NAME: &str = "speedtest-webhook";

/// Configuration errors detected after argument parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    #[error("OTLP endpoint must be an http:// or https:// URL, got {0:?}")]
    InvalidEndpoint(String),

    #[error("malformed OTLP header entry {0:?} (expected key=value)")]
    InvalidHeader(String),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Wire protocol used to ship telemetry to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportProtocol {
    /// OTLP over gRPC (tonic).
    #[value(name = "grpc")]
    Grpc,
    /// OTLP over HTTP with protobuf bodies.
    #[value(name = "http/protobuf")]
    HttpProtobuf,
}

/// Payload compression for exported telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportCompression {
    None,
    Gzip,
}

/// Speedtest webhook: turns speedtest results into OpenTelemetry metrics and traces.
#[derive(Parser, Debug, Clone)]
#[command(name = "speedtest-webhook")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// IP address to bind to
    #[arg(long, env = "STW_SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "STW_SERVER_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// OTLP collector endpoint for metrics and traces
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: String,

    /// Extra exporter headers as comma-separated key=value pairs
    #[arg(long, env = "OTEL_EXPORTER_OTLP_HEADERS")]
    pub otlp_headers: Option<String>,

    /// API key sent to the collector in the `api-key` header
    #[arg(long, env = "STW_OTLP_API_KEY", hide_env_values = true)]
    pub otlp_api_key: Option<String>,

    /// Export protocol
    #[arg(long, env = "OTEL_EXPORTER_OTLP_PROTOCOL", value_enum, default_value = "grpc")]
    pub otlp_protocol: ExportProtocol,

    /// Export compression
    #[arg(long, env = "OTEL_EXPORTER_OTLP_COMPRESSION", value_enum, default_value = "none")]
    pub otlp_compression: ExportCompression,

    /// Per-export timeout in milliseconds
    #[arg(long, env = "OTEL_EXPORTER_OTLP_TIMEOUT", default_value_t = 10_000)]
    pub otlp_timeout_ms: u64,

    /// Interval between metric exports in milliseconds
    #[arg(long, env = "OTEL_METRIC_EXPORT_INTERVAL", default_value_t = 60_000)]
    pub metric_export_interval_ms: u64,

    /// Service name attached to all exported telemetry
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Largest accepted webhook body in bytes
    #[arg(long, env = "STW_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Seconds to let in-flight requests finish after a shutdown signal
    #[arg(long, env = "STW_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Upper bound in seconds for flushing telemetry on exit
    #[arg(long, env = "STW_TELEMETRY_FLUSH_TIMEOUT_SECS", default_value_t = 10)]
    pub telemetry_flush_timeout_secs: u64,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check the settings clap cannot express on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.telemetry()?;
        if self.max_body_bytes == 0 {
            return Err(ConfigError::ZeroValue("max body size"));
        }
        Ok(())
    }

    /// Socket address the webhook listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        raw.parse().map_err(|_| ConfigError::InvalidAddress(raw))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn telemetry_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.telemetry_flush_timeout_secs)
    }

    /// Exporter settings for the telemetry bootstrap.
    pub fn telemetry(&self) -> Result<TelemetryConfig, ConfigError> {
        let endpoint = self.otlp_endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(self.otlp_endpoint.clone()));
        }
        if self.otlp_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("OTLP timeout"));
        }
        if self.metric_export_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("metric export interval"));
        }

        let mut headers = match &self.otlp_headers {
            Some(raw) => parse_headers(raw)?,
            None => Vec::new(),
        };
        if let Some(key) = self.otlp_api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.retain(|(name, _)| name != "api-key");
            headers.push(("api-key".to_string(), key.to_string()));
        }

        Ok(TelemetryConfig {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headers,
            protocol: self.otlp_protocol,
            compression: self.otlp_compression,
            timeout: Duration::from_millis(self.otlp_timeout_ms),
            metric_export_interval: Duration::from_millis(self.metric_export_interval_ms),
            service_name: self.service_name.clone(),
        })
    }

    /// Create a configuration for testing.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            otlp_endpoint: "http://localhost:4317".into(),
            otlp_headers: None,
            otlp_api_key: None,
            otlp_protocol: ExportProtocol::Grpc,
            otlp_compression: ExportCompression::None,
            otlp_timeout_ms: 10_000,
            metric_export_interval_ms: 60_000,
            service_name: DEFAULT_SERVICE_NAME.into(),
            log_level: "debug".into(),
            max_body_bytes: 1024 * 1024,
            shutdown_grace_secs: 5,
            telemetry_flush_timeout_secs: 10,
        }
    }
}

/// Parse `OTEL_EXPORTER_OTLP_HEADERS`-style `k1=v1,k2=v2` lists.
///
/// Header names are lowercased; empty entries are skipped.
pub fn parse_headers(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidHeader(entry.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidHeader(entry.to_string()));
            }
            Ok((key.to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}
