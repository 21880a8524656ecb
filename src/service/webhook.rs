//! `/webhook` handler.
//!
//! Turns one speedtest result into three histogram recordings and a span
//! event. Non-POST requests are rejected before any telemetry is produced.

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use opentelemetry::Context;

use crate::observability::spans::SpanGuard;
use crate::payload;
use crate::service::AppState;

/// Name of the span wrapping webhook processing.
pub const HANDLER_SPAN_NAME: &str = "handleWebhookRequest";

/// Name of the span event carrying the decoded result.
pub const RESULT_EVENT_NAME: &str = "speedtest.result";

/// Body returned for an accepted result.
pub const ACCEPTED_BODY: &str = "Webhook received and processed.\n";

fn plain_error(status: StatusCode, message: &str) -> Response {
    (status, format!("{message}\n")).into_response()
}

/// Handle a webhook delivery.
pub async fn handle_webhook(State(state): State<AppState>, request: Request) -> Response {
    if request.method() != Method::POST {
        tracing::debug!(method = %request.method(), "Rejecting non-POST webhook request");
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "POST")],
            "Method not allowed\n",
        )
            .into_response();
    }

    let parent = request
        .extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_else(Context::new);
    let mut span = SpanGuard::new(state.spans.start(HANDLER_SPAN_NAME, &parent));

    let body = match to_bytes(request.into_body(), state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read webhook body");
            span.record_error(&e);
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Error reading request body");
        }
    };

    let result = match payload::decode(&body) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode webhook payload");
            span.record_error(&e);
            return plain_error(StatusCode::BAD_REQUEST, "Error parsing JSON payload");
        }
    };

    tracing::info!(
        server_id = result.server_id,
        result_id = result.result_id,
        "Received speedtest result"
    );

    state.instruments.record(&result);
    span.add_event(RESULT_EVENT_NAME, result.event_attributes());

    (StatusCode::OK, ACCEPTED_BODY).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryInstruments, MemorySpanFactory};
    use axum::body::Body;
    use std::sync::Arc;

    fn state(max_body_bytes: usize) -> (AppState, MemoryInstruments, MemorySpanFactory) {
        let instruments = MemoryInstruments::default();
        let spans = MemorySpanFactory::default();
        let state = AppState::new(
            instruments.instruments(),
            Arc::new(spans.clone()),
            max_body_bytes,
        );
        (state, instruments, spans)
    }

    fn post(body: &'static str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/webhook")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_is_rejected_without_telemetry() {
        let (state, instruments, spans) = state(1024);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/webhook")
            .body(Body::empty())
            .unwrap();

        let response = handle_webhook(State(state), request).await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
        assert_eq!(instruments.total(), 0);
        assert!(spans.spans().is_empty());
    }

    #[tokio::test]
    async fn test_valid_result_is_recorded() {
        let (state, instruments, spans) = state(1024);

        let response = handle_webhook(
            State(state),
            post(r#"{"result_id":1,"serverId":2,"ping":3.5,"download":4,"upload":5}"#),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(instruments.ping.values(), vec![3.5]);
        assert_eq!(instruments.download.values(), vec![4.0]);
        assert_eq!(instruments.upload.values(), vec![5.0]);

        let spans = spans.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, HANDLER_SPAN_NAME);
        assert!(spans[0].ended);
        assert_eq!(spans[0].events.len(), 1);
        assert_eq!(spans[0].events[0].name, RESULT_EVENT_NAME);
    }

    #[tokio::test]
    async fn test_bad_json_records_error_and_no_metrics() {
        let (state, instruments, spans) = state(1024);

        let response = handle_webhook(State(state), post("not json")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(instruments.total(), 0);
        let spans = spans.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].ended);
        assert_eq!(spans[0].errors.len(), 1);
        assert!(spans[0].events.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_a_read_failure() {
        let (state, instruments, spans) = state(8);

        let response =
            handle_webhook(State(state), post(r#"{"ping": 25.5, "download": 1}"#)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(instruments.total(), 0);
        let spans = spans.spans();
        assert!(spans[0].ended);
        assert_eq!(spans[0].errors.len(), 1);
    }
}
