use chrono::{DateTime, Utc};
use dftr_abstraction::LossBreakdown;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::TrainingResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Array(Vec<f64>),
}

/// Metric name to value for one epoch (or one evaluation pass).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochMetrics(BTreeMap<String, MetricValue>);

impl EpochMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), MetricValue::Scalar(value));
    }

    pub fn insert_array(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.0.insert(name.into(), MetricValue::Array(values));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.0.get(name)
    }

    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(MetricValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

/// Running means of named scalars, reset at each epoch boundary.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sums: BTreeMap<String, (f64, u64)>,
}

impl MetricAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let entry = self.sums.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    /// Adds the total as `loss` plus every named term.
    pub fn add_losses(&mut self, losses: &LossBreakdown) {
        self.add("loss", f64::from(losses.total));
        for (name, value) in &losses.terms {
            self.add(name, f64::from(*value));
        }
    }

    #[must_use]
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.sums.get(name).filter(|(_, n)| *n > 0).map(|(s, n)| s / *n as f64)
    }

    /// `(sum, count)` for `name`, zero when never recorded.
    #[must_use]
    pub fn totals(&self, name: &str) -> (f64, u64) {
        self.sums.get(name).copied().unwrap_or((0.0, 0))
    }

    /// Means under `prefix/name`; clears the accumulator.
    pub fn finish(&mut self, prefix: &str) -> EpochMetrics {
        let mut out = EpochMetrics::new();
        for (name, (sum, n)) in std::mem::take(&mut self.sums) {
            if n > 0 {
                out.insert_scalar(format!("{prefix}/{name}"), sum / n as f64);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    Scalar {
        tag: String,
        step: u64,
        value: f64,
    },
    Epoch {
        phase: String,
        epoch: usize,
        metrics: EpochMetrics,
    },
    Image {
        tag: String,
        step: u64,
        #[serde(skip)]
        image: RgbImage,
    },
}

/// Receives metric events. Failures are logged, never propagated into the training loop.
pub trait MetricsSink: Send {
    fn record(&mut self, event: MetricEvent);

    fn flush(&mut self) {}
}

#[derive(Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&mut self, _event: MetricEvent) {}
}

/// Keeps events in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricsSink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
}

impl MemoryMetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&mut self, event: MetricEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    time: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a MetricEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

/// Appends events to `events.jsonl` in the monitoring directory; images go to `images/`.
pub struct JsonlMetricsSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetricsSink {
    pub fn open(dir: PathBuf) -> TrainingResult<Self> {
        std::fs::create_dir_all(dir.join("images"))?;
        let file = OpenOptions::new().create(true).append(true).open(dir.join("events.jsonl"))?;
        Ok(Self { dir, writer: BufWriter::new(file) })
    }

    fn write_image(&self, tag: &str, step: u64, image: &RgbImage) -> Option<String> {
        let name = format!("{}_{:08}.png", tag.replace('/', "_"), step);
        let path = self.dir.join("images").join(&name);
        match image.save(&path) {
            Ok(()) => Some(format!("images/{name}")),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write metric image");
                None
            }
        }
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record(&mut self, event: MetricEvent) {
        let path = match &event {
            MetricEvent::Image { tag, step, image } => self.write_image(tag, *step, image),
            _ => None,
        };
        let record = JsonlRecord { time: Utc::now(), event: &event, path };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode metric event");
                return;
            }
        };
        if let Err(e) = writeln!(self.writer, "{line}") {
            warn!(error = %e, "failed to write metric event");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "failed to flush metric events");
        }
    }
}

impl Drop for JsonlMetricsSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
