//! In-memory stand-ins for the telemetry capabilities.
//!
//! Used by unit and integration tests to assert exactly what a handler
//! recorded without running an exporter.

use opentelemetry::{Context, KeyValue};
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::observability::metrics::{Recorder, SpeedtestInstruments};
use crate::observability::spans::{EventSpan, SpanFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lookup(attributes: &[KeyValue], key: &str) -> Option<String> {
    attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}

/// One value passed to [`Recorder::record`].
#[derive(Debug, Clone)]
pub struct Recording {
    pub value: f64,
    pub attributes: Vec<KeyValue>,
}

impl Recording {
    /// String form of the attribute named `key`.
    pub fn attribute(&self, key: &str) -> Option<String> {
        lookup(&self.attributes, key)
    }
}

/// Histogram that keeps every recording.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    recordings: Mutex<Vec<Recording>>,
}

impl MemoryRecorder {
    pub fn recordings(&self) -> Vec<Recording> {
        lock(&self.recordings).clone()
    }

    pub fn values(&self) -> Vec<f64> {
        lock(&self.recordings).iter().map(|r| r.value).collect()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, value: f64, attributes: &[KeyValue]) {
        lock(&self.recordings).push(Recording {
            value,
            attributes: attributes.to_vec(),
        });
    }
}

/// The three speedtest histograms backed by [`MemoryRecorder`]s.
#[derive(Debug, Default, Clone)]
pub struct MemoryInstruments {
    pub ping: Arc<MemoryRecorder>,
    pub download: Arc<MemoryRecorder>,
    pub upload: Arc<MemoryRecorder>,
}

impl MemoryInstruments {
    pub fn instruments(&self) -> SpeedtestInstruments {
        SpeedtestInstruments::from_recorders(
            self.ping.clone(),
            self.download.clone(),
            self.upload.clone(),
        )
    }

    /// Total recordings across all three histograms.
    pub fn total(&self) -> usize {
        self.ping.recordings().len()
            + self.download.recordings().len()
            + self.upload.recordings().len()
    }
}

/// Event attached to a [`RecordedSpan`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub name: &'static str,
    pub attributes: Vec<KeyValue>,
}

impl RecordedEvent {
    pub fn attribute(&self, key: &str) -> Option<String> {
        lookup(&self.attributes, key)
    }
}

/// Everything a handler did to one span.
#[derive(Debug, Clone, Default)]
pub struct RecordedSpan {
    pub name: &'static str,
    pub events: Vec<RecordedEvent>,
    pub errors: Vec<String>,
    pub ended: bool,
}

/// [`SpanFactory`] that records spans in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySpanFactory {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl MemorySpanFactory {
    /// Snapshot of all spans started so far, in start order.
    pub fn spans(&self) -> Vec<RecordedSpan> {
        lock(&self.spans).clone()
    }
}

impl SpanFactory for MemorySpanFactory {
    fn start(&self, name: &'static str, _parent: &Context) -> Box<dyn EventSpan> {
        let mut spans = lock(&self.spans);
        spans.push(RecordedSpan {
            name,
            ..Default::default()
        });
        Box::new(MemorySpan {
            spans: self.spans.clone(),
            index: spans.len() - 1,
        })
    }
}

struct MemorySpan {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
    index: usize,
}

impl MemorySpan {
    fn with<F: FnOnce(&mut RecordedSpan)>(&self, f: F) {
        if let Some(span) = lock(&self.spans).get_mut(self.index) {
            f(span);
        }
    }
}

impl EventSpan for MemorySpan {
    fn add_event(&mut self, name: &'static str, attributes: Vec<KeyValue>) {
        self.with(|span| span.events.push(RecordedEvent { name, attributes }));
    }

    fn record_error(&mut self, err: &dyn Error) {
        let message = err.to_string();
        self.with(|span| span.errors.push(message));
    }

    fn end(&mut self) {
        self.with(|span| span.ended = true);
    }
}
