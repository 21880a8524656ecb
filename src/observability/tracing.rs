//! Log output setup.
//!
//! Configures structured logging with:
//! - Environment-based filter (`RUST_LOG`), falling back to the configured level
//! - Console output with target, thread, file and line

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive used when `RUST_LOG` is unset.
fn default_directive(log_level: &str) -> String {
    format!("{log_level},h2=warn,hyper=warn,tower=warn,reqwest=warn")
}

/// Initialize logging at `log_level`.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(log_level)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    tracing::info!(log_level, "Logging initialized");
}

/// Initialize tracing for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}
