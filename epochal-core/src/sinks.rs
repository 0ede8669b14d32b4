//! Progress and scalar-metric sinks.
//!
//! The scheduler emits one [`ProgressRecord`] per training iteration and a
//! stream of `(tag, value, global_step)` scalars. Where they end up (console,
//! file, dashboard) is decided by the sink implementations handed to it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Structured per-iteration progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub epoch: usize,
    pub end_epoch: usize,
    pub iteration: usize,
    pub iterations_per_epoch: usize,
    pub lr: f64,
    /// Rolling average seconds per iteration.
    pub total_avg: f64,
    pub compute_avg: f64,
    pub read_avg: f64,
    pub hours_per_epoch: f64,
    pub losses: BTreeMap<String, f64>,
}

impl std::fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Epoch {}/{} itr {}/{}: lr: {} speed: {:.2}({:.2}s r{:.2})s/itr {:.2}h/epoch",
            self.epoch,
            self.end_epoch,
            self.iteration,
            self.iterations_per_epoch,
            Compact(self.lr),
            self.total_avg,
            self.compute_avg,
            self.read_avg,
            self.hours_per_epoch,
        )?;
        for (name, value) in &self.losses {
            write!(f, " loss_{name}: {value:.4}")?;
        }
        Ok(())
    }
}

/// `%g`-style float: six significant digits, exponent form outside `[1e-4, 1e6)`.
struct Compact(f64);

impl std::fmt::Display for Compact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = self.0;
        if value == 0.0 || !value.is_finite() {
            return write!(f, "{value}");
        }
        let sci = format!("{value:.5e}");
        let Some((mantissa, exp)) = sci.split_once('e') else {
            return write!(f, "{value}");
        };
        let Ok(exp) = exp.parse::<i32>() else {
            return write!(f, "{value}");
        };
        if (-4..6).contains(&exp) {
            let decimals = (5 - exp) as usize;
            let fixed = format!("{value:.decimals$}");
            f.write_str(trim_zeros(&fixed))
        } else {
            write!(f, "{}e{exp}", trim_zeros(mantissa))
        }
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Receives one formatted line per training iteration.
pub trait ProgressSink: Send {
    fn log_line(&mut self, line: &str);
}

/// Receives scalar metrics for a dashboard.
pub trait ScalarSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, global_step: u64);

    fn flush(&mut self) {}
}

/// Forwards progress lines to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn log_line(&mut self, line: &str) {
        tracing::info!(target: "epochal::progress", "{line}");
    }
}

/// Discards every scalar.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScalars;

impl ScalarSink for NullScalars {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _global_step: u64) {}
}

#[derive(Serialize)]
struct ScalarLine<'a> {
    tag: &'a str,
    value: f64,
    step: u64,
    wall_time: f64,
}

/// Appends one JSON object per scalar to a file.
pub struct JsonlScalarWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl JsonlScalarWriter {
    pub fn create(path: &Path, flush_every: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_line(&mut self, tag: &str, value: f64, step: u64) -> std::io::Result<()> {
        let line = ScalarLine {
            tag,
            value,
            step,
            wall_time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        serde_json::to_writer(&mut self.writer, &line).map_err(std::io::Error::other)?;
        self.writer.write_all(b"\n")?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.writer.flush()?;
            self.pending = 0;
        }
        Ok(())
    }
}

impl ScalarSink for JsonlScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, global_step: u64) {
        if let Err(e) = self.write_line(tag, value, global_step) {
            tracing::warn!(tag, error = %e, "Failed to write scalar");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(error = %e, "Failed to flush scalar log");
        }
        self.pending = 0;
    }
}

impl Drop for JsonlScalarWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// A scalar as captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedScalar {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

/// Sink that keeps everything in memory. Clones share the same buffers, so a
/// test can hand one clone to the scheduler and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
    scalars: Arc<Mutex<Vec<RecordedScalar>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn scalars(&self) -> Vec<RecordedScalar> {
        self.scalars.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Scalars whose tag equals `tag`, in emission order.
    pub fn scalars_for(&self, tag: &str) -> Vec<RecordedScalar> {
        self.scalars()
            .into_iter()
            .filter(|s| s.tag == tag)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn log_line(&mut self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

impl ScalarSink for RecordingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, global_step: u64) {
        if let Ok(mut scalars) = self.scalars.lock() {
            scalars.push(RecordedScalar {
                tag: tag.to_string(),
                value,
                step: global_step,
            });
        }
    }
}
