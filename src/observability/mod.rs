//! OpenTelemetry observability infrastructure.
//!
//! Provides:
//! - OTLP provider bootstrap and teardown
//! - The speedtest histogram instruments
//! - Span capabilities for request handlers
//! - Request instrumentation middleware
//! - Structured log setup

pub mod http;
pub mod metrics;
pub mod spans;
pub mod telemetry;
pub mod tracing;
