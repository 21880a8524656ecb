//! HTTP routes for the webhook service.

pub mod webhook;

use axum::middleware;
use axum::routing::any;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::observability::http::{instrument_request, HttpInstrumentation};
use crate::observability::metrics::SpeedtestInstruments;
use crate::observability::spans::SpanFactory;

/// Path the speedtest source delivers results to.
pub const WEBHOOK_ROUTE: &str = "/webhook";

/// Dependencies handed to every request, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub instruments: SpeedtestInstruments,
    pub spans: Arc<dyn SpanFactory>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        instruments: SpeedtestInstruments,
        spans: Arc<dyn SpanFactory>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            instruments,
            spans,
            max_body_bytes,
        }
    }
}

/// Build the application router.
///
/// Every method on `/webhook` reaches the handler so it can answer 405 itself.
/// The instrumentation layer wraps all routes and the 404 fallback.
pub fn create_router(state: AppState, http: HttpInstrumentation) -> Router {
    Router::new()
        .route(WEBHOOK_ROUTE, any(webhook::handle_webhook))
        .with_state(state)
        .layer(middleware::from_fn_with_state(http, instrument_request))
        .layer(TraceLayer::new_for_http())
}
