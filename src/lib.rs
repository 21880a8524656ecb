//! Speedtest webhook: receives speedtest results over HTTP and forwards them
//! as OpenTelemetry metrics and traces.
//!
//! Each `POST /webhook` delivery is decoded leniently, recorded into three
//! histograms (`speedtest.ping`, `speedtest.download`, `speedtest.upload`)
//! tagged by server and ISP, and attached to a trace span as a
//! `speedtest.result` event. Export to the collector is left to the OTLP
//! pipeline.
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`observability`]: Telemetry bootstrap, instruments, spans, logging
//! - [`payload`]: Webhook payload decoding
//! - [`server`]: Listener lifecycle and startup sequencing
//! - [`service`]: HTTP routes and the webhook handler
//! - [`shutdown`]: Shutdown trigger and serving phases
//! - `testing`: In-memory telemetry doubles for tests (`testing` feature)

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // observability::metrics::HistogramSpec is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // Panic docs can be verbose
)]

pub mod config;
pub mod observability;
pub mod payload;
pub mod server;
pub mod service;
pub mod shutdown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use payload::{decode, DecodeError, SpeedtestResult};
pub use server::{run_server, WebhookServer};
pub use shutdown::{Phase, ShutdownOutcome, ShutdownTrigger};
