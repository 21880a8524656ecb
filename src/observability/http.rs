//! Request instrumentation for the HTTP router.
//!
//! Every request, matched or not, gets:
//! - a server span continuing any inbound W3C `traceparent`
//! - an `http.server.request.duration` recording tagged with method, status and route
//! - an `http.server.active_requests` increment for its lifetime
//!
//! The span's [`Context`] is stored in the request extensions so handlers can
//! parent their own spans on it.

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::metrics::{Histogram, Meter, UpDownCounter};
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Tracer;
use std::sync::Arc;
use std::time::Instant;

/// Reads propagation headers from an HTTP header map.
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Decrements `http.server.active_requests` when the request finishes or is dropped.
struct ActiveRequest<'a> {
    counter: &'a UpDownCounter<i64>,
    attributes: &'a [KeyValue],
}

impl<'a> ActiveRequest<'a> {
    fn enter(counter: &'a UpDownCounter<i64>, attributes: &'a [KeyValue]) -> Self {
        counter.add(1, attributes);
        Self {
            counter,
            attributes,
        }
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.counter.add(-1, self.attributes);
    }
}

/// Tracer, propagator and instruments shared by the middleware.
#[derive(Clone)]
pub struct HttpInstrumentation {
    inner: Arc<Inner>,
}

struct Inner {
    tracer: Tracer,
    propagator: TraceContextPropagator,
    duration: Histogram<f64>,
    active_requests: UpDownCounter<i64>,
}

impl HttpInstrumentation {
    pub fn new(tracer: Tracer, meter: &Meter) -> Self {
        let duration = meter
            .f64_histogram("http.server.request.duration")
            .with_description("Duration of HTTP server requests")
            .with_unit("s")
            .init();
        let active_requests = meter
            .i64_up_down_counter("http.server.active_requests")
            .with_description("Number of in-flight HTTP server requests")
            .with_unit("{request}")
            .init();

        Self {
            inner: Arc::new(Inner {
                tracer,
                propagator: TraceContextPropagator::new(),
                duration,
                active_requests,
            }),
        }
    }

    /// Continue the caller's trace, if the request carries one.
    fn parent_context(&self, headers: &HeaderMap) -> Context {
        self.inner.propagator.extract(&HeaderExtractor(headers))
    }
}

impl std::fmt::Debug for HttpInstrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpInstrumentation").finish_non_exhaustive()
    }
}

/// Span name for a request: `"{METHOD} {route}"`, or just the method when no route matched.
pub fn span_name(method: &str, route: Option<&str>) -> String {
    match route {
        Some(route) => format!("{method} {route}"),
        None => method.to_string(),
    }
}

/// Axum middleware wrapping every request in a server span and request metrics.
pub async fn instrument_request(
    State(http): State<HttpInstrumentation>,
    matched_path: Option<MatchedPath>,
    mut request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().as_str().to_owned();
    let route = matched_path.as_ref().map(|path| path.as_str().to_owned());

    let parent = http.parent_context(request.headers());
    let mut attributes = vec![
        KeyValue::new("http.request.method", method.clone()),
        KeyValue::new("url.path", request.uri().path().to_owned()),
    ];
    if let Some(route) = &route {
        attributes.push(KeyValue::new("http.route", route.clone()));
    }

    let span = http
        .inner
        .tracer
        .span_builder(span_name(&method, route.as_deref()))
        .with_kind(SpanKind::Server)
        .with_attributes(attributes)
        .start_with_context(&http.inner.tracer, &parent);
    let cx = parent.with_span(span);

    let mut metric_attrs = vec![KeyValue::new("http.request.method", method)];
    if let Some(route) = route {
        metric_attrs.push(KeyValue::new("http.route", route));
    }

    request.extensions_mut().insert(cx.clone());
    let response = {
        let _active = ActiveRequest::enter(&http.inner.active_requests, &metric_attrs);
        next.run(request).await
    };

    let status = response.status();
    metric_attrs.push(KeyValue::new(
        "http.response.status_code",
        i64::from(status.as_u16()),
    ));
    http.inner
        .duration
        .record(start.elapsed().as_secs_f64(), &metric_attrs);

    let span = cx.span();
    span.set_attribute(KeyValue::new(
        "http.response.status_code",
        i64::from(status.as_u16()),
    ));
    if status.is_server_error() {
        span.set_status(Status::error(status.to_string()));
    }
    span.end();

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_span_name() {
        assert_eq!(span_name("POST", Some("/webhook")), "POST /webhook");
        assert_eq!(span_name("GET", None), "GET");
    }

    #[test]
    fn test_header_extractor() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static("00-abc-def-01"));

        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("tracestate"), None);
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }
}
