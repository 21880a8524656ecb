//! Narrow span capabilities used by request handlers.
//!
//! Handlers only ever start a span, attach events, record errors and end it.
//! Keeping that surface small lets tests swap in an in-memory recorder.

use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::{Context, KeyValue};
use std::borrow::Cow;
use std::error::Error;

/// A started span.
pub trait EventSpan: Send {
    fn add_event(&mut self, name: &'static str, attributes: Vec<KeyValue>);

    /// Attach `err` to the span and mark it failed.
    fn record_error(&mut self, err: &dyn Error);

    fn end(&mut self);
}

/// Starts spans under a parent context.
pub trait SpanFactory: Send + Sync {
    fn start(&self, name: &'static str, parent: &Context) -> Box<dyn EventSpan>;
}

/// Ends the wrapped span when dropped, so every exit path closes it.
pub struct SpanGuard {
    span: Box<dyn EventSpan>,
}

impl SpanGuard {
    pub fn new(span: Box<dyn EventSpan>) -> Self {
        Self { span }
    }

    pub fn add_event(&mut self, name: &'static str, attributes: Vec<KeyValue>) {
        self.span.add_event(name, attributes);
    }

    pub fn record_error(&mut self, err: &dyn Error) {
        self.span.record_error(err);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.span.end();
    }
}

/// [`SpanFactory`] backed by an OpenTelemetry tracer.
#[derive(Clone, Debug)]
pub struct OtelSpanFactory<T> {
    tracer: T,
}

impl<T> OtelSpanFactory<T> {
    pub fn new(tracer: T) -> Self {
        Self { tracer }
    }
}

impl<T> SpanFactory for OtelSpanFactory<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn start(&self, name: &'static str, parent: &Context) -> Box<dyn EventSpan> {
        Box::new(OtelEventSpan(self.tracer.start_with_context(name, parent)))
    }
}

struct OtelEventSpan<S>(S);

impl<S> EventSpan for OtelEventSpan<S>
where
    S: Span + Send + Sync,
{
    fn add_event(&mut self, name: &'static str, attributes: Vec<KeyValue>) {
        self.0.add_event(name, attributes);
    }

    fn record_error(&mut self, err: &dyn Error) {
        self.0.record_error(err);
        self.0.set_status(Status::error(Cow::Owned(err.to_string())));
    }

    fn end(&mut self) {
        self.0.end();
    }
}
