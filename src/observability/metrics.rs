//! Speedtest histogram instruments.
//!
//! Key metrics:
//! - speedtest.ping: Histogram of ping latency (ms)
//! - speedtest.download: Histogram of download throughput (bps)
//! - speedtest.upload: Histogram of upload throughput (bps)
//!
//! All three are recorded with `server.id`, `server.name` and `isp`.

use opentelemetry::metrics::{Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::Arc;

use crate::payload::SpeedtestResult;

/// Static definition of a histogram instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramSpec {
    pub name: &'static str,
    pub unit: &'static str,
    pub description: &'static str,
}

pub const PING: HistogramSpec = HistogramSpec {
    name: "speedtest.ping",
    unit: "ms",
    description: "Ping latency",
};

pub const DOWNLOAD: HistogramSpec = HistogramSpec {
    name: "speedtest.download",
    unit: "bps",
    description: "Download speed",
};

pub const UPLOAD: HistogramSpec = HistogramSpec {
    name: "speedtest.upload",
    unit: "bps",
    description: "Upload speed",
};

const MAX_NAME_LEN: usize = 255;
const MAX_UNIT_LEN: usize = 63;

/// An instrument definition the SDK would reject.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("invalid instrument name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid unit {unit:?} for instrument {name}")]
    InvalidUnit { name: String, unit: String },
}

impl HistogramSpec {
    /// Check the definition against the OpenTelemetry instrument rules.
    pub fn validate(&self) -> Result<(), InstrumentError> {
        let invalid = |reason| InstrumentError::InvalidName {
            name: self.name.to_string(),
            reason,
        };

        match self.name.chars().next() {
            None => return Err(invalid("name is empty")),
            Some(c) if !c.is_ascii_alphabetic() => {
                return Err(invalid("name must start with a letter"))
            }
            Some(_) => {}
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(invalid("name is longer than 255 characters"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
        {
            return Err(invalid("name contains characters outside [A-Za-z0-9_.-/]"));
        }
        if self.unit.len() > MAX_UNIT_LEN || !self.unit.is_ascii() {
            return Err(InstrumentError::InvalidUnit {
                name: self.name.to_string(),
                unit: self.unit.to_string(),
            });
        }
        Ok(())
    }

    /// Validate and create the histogram on `meter`.
    pub fn build(&self, meter: &Meter) -> Result<Histogram<f64>, InstrumentError> {
        self.validate()?;
        Ok(meter
            .f64_histogram(self.name)
            .with_description(self.description)
            .with_unit(self.unit)
            .init())
    }
}

/// Sink for a single histogram.
///
/// Implementations must be safe to call from many requests at once.
pub trait Recorder: Send + Sync {
    fn record(&self, value: f64, attributes: &[KeyValue]);
}

impl Recorder for Histogram<f64> {
    fn record(&self, value: f64, attributes: &[KeyValue]) {
        Histogram::record(self, value, attributes);
    }
}

/// The three speedtest histograms, created once at startup.
#[derive(Clone)]
pub struct SpeedtestInstruments {
    ping: Arc<dyn Recorder>,
    download: Arc<dyn Recorder>,
    upload: Arc<dyn Recorder>,
}

impl SpeedtestInstruments {
    /// Create the histograms from `meter`. Any invalid definition is fatal.
    pub fn from_meter(meter: &Meter) -> Result<Self, InstrumentError> {
        Ok(Self {
            ping: Arc::new(PING.build(meter)?),
            download: Arc::new(DOWNLOAD.build(meter)?),
            upload: Arc::new(UPLOAD.build(meter)?),
        })
    }

    /// Wrap existing recorders, e.g. in-memory ones for tests.
    pub fn from_recorders(
        ping: Arc<dyn Recorder>,
        download: Arc<dyn Recorder>,
        upload: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            ping,
            download,
            upload,
        }
    }

    /// Record one value into each histogram, tagged with the result's server and ISP.
    pub fn record(&self, result: &SpeedtestResult) {
        let attrs = result.metric_attributes();
        self.ping.record(result.ping, &attrs);
        self.download.record(result.download, &attrs);
        self.upload.record(result.upload, &attrs);
    }
}

impl std::fmt::Debug for SpeedtestInstruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedtestInstruments").finish_non_exhaustive()
    }
}
