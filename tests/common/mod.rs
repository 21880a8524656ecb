//! Test utilities and server harness for webhook tests.
//!
//! Provides:
//! - A router wired to in-memory instruments and span exporters
//! - A bound server running on an ephemeral port
//! - A raw HTTP/1.1 client for driving requests byte by byte

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;
use speedtest_webhook::observability::http::HttpInstrumentation;
use speedtest_webhook::observability::spans::{OtelSpanFactory, SpanFactory};
use speedtest_webhook::observability::tracing::init_test_tracing;
use speedtest_webhook::server::WebhookServer;
use speedtest_webhook::service::{create_router, AppState};
use speedtest_webhook::shutdown::{Phase, ShutdownOutcome, ShutdownTrigger};
use speedtest_webhook::testing::{MemoryInstruments, MemorySpanFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Body from a typical speedtest delivery.
pub const SAMPLE_RESULT: &str = r#"{"result_id":123,"serverId":456,"serverName":"Test Server","isp":"Example ISP","ping":25.5,"download":100000000,"upload":50000000}"#;

pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Router plus handles on everything it records.
pub struct TestApp {
    pub router: Router,
    pub instruments: MemoryInstruments,
    /// Handler spans. Empty when built with [`TestApp::traced`].
    pub spans: MemorySpanFactory,
    /// Spans finished through the SDK tracer.
    pub exporter: InMemorySpanExporter,
    _tracer_provider: TracerProvider,
    _meter_provider: SdkMeterProvider,
}

impl TestApp {
    /// Handler spans go to [`MemorySpanFactory`], server spans to the exporter.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Handler and server spans both go to the exporter.
    pub fn traced() -> Self {
        Self::build(true)
    }

    fn build(traced: bool) -> Self {
        init_test_tracing();

        let exporter = InMemorySpanExporter::default();
        let tracer_provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(ManualReader::builder().build())
            .build();
        let meter = opentelemetry::metrics::MeterProvider::meter(&meter_provider, "webhook-test");

        let instruments = MemoryInstruments::default();
        let spans = MemorySpanFactory::default();
        let span_factory: Arc<dyn SpanFactory> = if traced {
            Arc::new(OtelSpanFactory::new(tracer_provider.tracer("webhook-test")))
        } else {
            Arc::new(spans.clone())
        };

        let state = AppState::new(instruments.instruments(), span_factory, MAX_BODY_BYTES);
        let http = HttpInstrumentation::new(tracer_provider.tracer("webhook-test"), &meter);

        Self {
            router: create_router(state, http),
            instruments,
            spans,
            exporter,
            _tracer_provider: tracer_provider,
            _meter_provider: meter_provider,
        }
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}

pub fn request(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

/// A [`TestApp`] served on `127.0.0.1` at an ephemeral port.
pub struct RunningServer {
    pub app: TestApp,
    pub addr: SocketAddr,
    pub trigger: ShutdownTrigger,
    pub phase: watch::Receiver<Phase>,
    pub handle: JoinHandle<Result<ShutdownOutcome, speedtest_webhook::server::ServerError>>,
}

impl RunningServer {
    pub async fn start(grace: Duration) -> Self {
        let app = TestApp::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = WebhookServer::bind(addr, app.router.clone(), grace)
            .await
            .expect("failed to bind test server");
        let addr = server.local_addr().unwrap();
        let phase = server.phase();

        let (trigger, shutdown_rx) = ShutdownTrigger::new();
        let handle = tokio::spawn(server.run(shutdown_rx));

        Self {
            app,
            addr,
            trigger,
            phase,
            handle,
        }
    }
}

/// HTTP/1.1 request head for a POST to `/webhook` announcing `content_length` bytes.
pub fn post_head(content_length: usize) -> String {
    format!(
        "POST /webhook HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
    )
}

/// Write `bytes` to a fresh connection without waiting for a response.
pub async fn open_request(addr: SocketAddr, bytes: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("failed to connect");
    stream.write_all(bytes).await.unwrap();
    stream
}

/// Finish writing a request and return the response status code and body.
pub async fn finish_request(mut stream: TcpStream, rest: &[u8]) -> (u16, String) {
    stream.write_all(rest).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

/// Send one complete POST to `/webhook`.
pub async fn post_webhook(addr: SocketAddr, body: &str) -> (u16, String) {
    let stream = open_request(addr, post_head(body.len()).as_bytes()).await;
    finish_request(stream, body.as_bytes()).await
}

fn parse_response(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(raw);
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("malformed response: {text:?}"));
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Wait for a condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let (status, body) =
            parse_response(b"HTTP/1.1 405 Method Not Allowed\r\nallow: POST\r\n\r\nMethod not allowed\n");
        assert_eq!(status, 405);
        assert_eq!(body, "Method not allowed\n");
    }
}
