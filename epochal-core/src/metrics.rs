//! Evaluation metric aggregation and per-run training history.

use crate::error::MetricError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sample's value for one metric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl MetricValue {
    fn elements(&self) -> &[f64] {
        match self {
            MetricValue::Scalar(v) => std::slice::from_ref(v),
            MetricValue::Vector(v) => v,
        }
    }
}

/// One sample's evaluation output, keyed by metric/output name.
pub type EvalRecord = BTreeMap<String, MetricValue>;

/// Per-key metric sequences for a contiguous run of samples.
pub type MetricBatch = BTreeMap<String, Vec<MetricValue>>;

/// A batch-shaped model output: leading dimension is the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchArray {
    /// Shape `[batch]`.
    Scalars(Vec<f64>),
    /// Shape `[batch, n]`.
    Vectors(Vec<Vec<f64>>),
}

impl BatchArray {
    pub fn batch_size(&self) -> usize {
        match self {
            BatchArray::Scalars(v) => v.len(),
            BatchArray::Vectors(v) => v.len(),
        }
    }

    fn into_samples(self) -> Vec<MetricValue> {
        match self {
            BatchArray::Scalars(v) => v.into_iter().map(MetricValue::Scalar).collect(),
            BatchArray::Vectors(v) => v.into_iter().map(MetricValue::Vector).collect(),
        }
    }
}

/// Test-mode model output, one batch-shaped array per key.
pub type BatchOutput = BTreeMap<String, BatchArray>;

/// Split a batch output along its leading dimension into per-sample records.
///
/// Every key must agree on the batch size.
pub fn split_batch(output: BatchOutput) -> Result<Vec<EvalRecord>, MetricError> {
    let mut batch_size: Option<usize> = None;
    for (key, array) in &output {
        let n = array.batch_size();
        match batch_size {
            None => batch_size = Some(n),
            Some(expected) if expected != n => {
                return Err(MetricError::ShapeMismatch {
                    key: key.clone(),
                    expected,
                    actual: n,
                });
            }
            Some(_) => {}
        }
    }

    let mut records = vec![EvalRecord::new(); batch_size.unwrap_or(0)];
    for (key, array) in output {
        for (record, value) in records.iter_mut().zip(array.into_samples()) {
            record.insert(key.clone(), value);
        }
    }
    Ok(records)
}

/// Per-key metric values for one whole evaluation pass.
///
/// Sequences grow in global sample order; the accumulator refuses batches
/// that don't start where the previous one ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalAccumulator {
    values: BTreeMap<String, Vec<MetricValue>>,
    next_index: usize,
}

impl EvalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append per-sample records starting at global sample `starting_index`.
    /// Returns the new running index, `starting_index + sample_outputs.len()`.
    pub fn accumulate(
        &mut self,
        sample_outputs: Vec<EvalRecord>,
        starting_index: usize,
    ) -> Result<usize, MetricError> {
        self.check_index(starting_index)?;
        let count = sample_outputs.len();
        for record in sample_outputs {
            for (key, value) in record {
                self.values.entry(key).or_default().push(value);
            }
        }
        self.next_index = starting_index + count;
        Ok(self.next_index)
    }

    /// Append an evaluator's per-key results for `sample_count` samples
    /// starting at `starting_index`.
    pub fn merge(
        &mut self,
        batch: MetricBatch,
        starting_index: usize,
        sample_count: usize,
    ) -> Result<usize, MetricError> {
        self.check_index(starting_index)?;
        for (key, values) in batch {
            self.values.entry(key).or_default().extend(values);
        }
        self.next_index = starting_index + sample_count;
        Ok(self.next_index)
    }

    fn check_index(&self, starting_index: usize) -> Result<(), MetricError> {
        if starting_index != self.next_index {
            return Err(MetricError::IndexMismatch {
                expected: self.next_index,
                actual: starting_index,
            });
        }
        Ok(())
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn get(&self, key: &str) -> Option<&[MetricValue]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of every key over all of its elements, flattening vector values.
    /// Keys with no elements are left out.
    pub fn summarize(&self) -> BTreeMap<String, f64> {
        let mut means = BTreeMap::new();
        for (key, values) in &self.values {
            let (sum, n) = values
                .iter()
                .flat_map(MetricValue::elements)
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if n == 0 {
                tracing::debug!(key = %key, "Skipping empty metric in summary");
                continue;
            }
            means.insert(key.clone(), sum / n as f64);
        }
        means
    }
}

/// Summary of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub mean_train_loss: f64,
    pub eval_means: BTreeMap<String, f64>,
    pub skipped_steps: u64,
}

/// History of the epochs a run completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistory {
    pub epochs: Vec<EpochSummary>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl RunHistory {
    pub fn record_epoch(&mut self, summary: EpochSummary) {
        let loss = summary.mean_train_loss;
        if self.best_loss.is_none_or(|best| loss < best) {
            self.best_loss = Some(loss);
            self.best_epoch = Some(summary.epoch);
        }
        self.epochs.push(summary);
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs.len()
    }

    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }
}
