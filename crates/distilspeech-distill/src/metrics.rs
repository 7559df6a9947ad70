//! Metric sinks.
//!
//! The trainer reports scalar metrics (`train/loss`, `eval/wer`, ...) at a
//! step. Sinks decide where they go: the tracing log, a JSONL file next to
//! the checkpoints, or both.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::DistillResult;

pub trait MetricsSink: Send {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) -> DistillResult<()>;

    fn flush(&mut self) -> DistillResult<()> {
        Ok(())
    }
}

/// Logs each report as one `info!` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) -> DistillResult<()> {
        let formatted: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v:.6}")).collect();
        info!(step, metrics = %formatted.join(" "), "Metrics");
        Ok(())
    }
}

/// Appends one JSON object per report to `metrics.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    /// Open (appending) `dir/metrics.jsonl`.
    pub fn open(dir: &Path) -> DistillResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) -> DistillResult<()> {
        let mut obj = Map::new();
        obj.insert("step".into(), Value::from(step));
        obj.insert("timestamp".into(), Value::from(Utc::now().to_rfc3339()));
        for (k, v) in metrics {
            // NaN and infinities have no JSON form
            let value = serde_json::Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null);
            obj.insert((*k).to_string(), value);
        }
        writeln!(self.writer, "{}", Value::Object(obj))?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> DistillResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every report to several sinks.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn MetricsSink>) {
        self.sinks.push(sink);
    }
}

impl MetricsSink for FanOut {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) -> DistillResult<()> {
        for sink in &mut self.sinks {
            sink.record(step, metrics)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> DistillResult<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Keeps every report in memory. Clones share the same record list.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(u64, Vec<(String, f64)>)>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<(u64, Vec<(String, f64)>)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Last reported value of `name`.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.records()
            .iter()
            .rev()
            .find_map(|(_, m)| m.iter().find(|(k, _)| k == name).map(|(_, v)| *v))
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) -> DistillResult<()> {
        let entry = (step, metrics.iter().map(|(k, v)| ((*k).to_string(), *v)).collect());
        if let Ok(mut records) = self.records.lock() {
            records.push(entry);
        }
        Ok(())
    }
}
