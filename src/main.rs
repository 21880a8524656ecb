//! Speedtest webhook server.
//!
//! # Usage
//!
//! ```bash
//! speedtest-webhook --port 8080 --otlp-endpoint http://localhost:4317
//! ```
//!
//! Environment variables can also be used:
//! - `STW_SERVER_PORT`: Port to listen on
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint
//! - `OTEL_EXPORTER_OTLP_HEADERS` / `STW_OTLP_API_KEY`: Collector credentials
//! - `RUST_LOG`: Log filter (overrides `--log-level`)

use speedtest_webhook::config::Config;
use speedtest_webhook::observability::tracing::init_tracing;
use speedtest_webhook::server::run_server;
use speedtest_webhook::shutdown::{signal_shutdown, ShutdownTrigger};

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  speedtest-webhook v{}

  Configuration:
    Address:    {}:{}
    Collector:  {} ({:?})
    Service:    {}
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.host,
        config.port,
        config.otlp_endpoint,
        config.otlp_protocol,
        config.service_name,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing(&config.log_level);
    print_banner(&config);

    let (trigger, shutdown_rx) = ShutdownTrigger::new();
    tokio::spawn(signal_shutdown(trigger));

    let outcome = run_server(config, shutdown_rx).await?;

    tracing::info!(outcome = ?outcome, "speedtest-webhook shutdown complete");
    Ok(())
}
