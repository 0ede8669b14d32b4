//! Contracts for the external collaborators the scheduler drives.
//!
//! The core never looks inside a model, optimizer or data source. It only
//! relies on the traits below plus a handful of plain data types that cross
//! the boundary (batches, loss maps, parameter and gradient buffers).

use crate::error::{DataError, ModelError, OptimizerError};
use crate::metrics::{BatchOutput, EvalRecord, MetricBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mini-batch as yielded by a data supply. Immutable once yielded.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<I, T> {
    pub inputs: I,
    pub targets: T,
    pub meta_info: BTreeMap<String, serde_json::Value>,
}

impl<I, T> Batch<I, T> {
    pub fn new(inputs: I, targets: T) -> Self {
        Self {
            inputs,
            targets,
            meta_info: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta_info.insert(key.into(), value);
        self
    }
}

/// Forward-pass mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Test,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Test => write!(f, "test"),
        }
    }
}

/// A single loss component, either already reduced or per sample.
#[derive(Debug, Clone, PartialEq)]
pub enum LossValue {
    Scalar(f32),
    PerSample(Vec<f32>),
}

impl LossValue {
    /// Reduce to a mean scalar. An empty per-sample vector has no mean.
    pub fn mean(&self, name: &str) -> Result<f32, ModelError> {
        match self {
            LossValue::Scalar(v) => Ok(*v),
            LossValue::PerSample(values) if values.is_empty() => Err(ModelError::InvalidLoss {
                name: name.to_string(),
                reason: "empty per-sample loss".to_string(),
            }),
            LossValue::PerSample(values) => {
                Ok(values.iter().sum::<f32>() / values.len() as f32)
            }
        }
    }
}

/// Loss components keyed by name. Keys are stable within a run.
pub type LossMap = BTreeMap<String, LossValue>;

/// Reduce every component to its mean. Returns the per-component scalars and
/// their sum, the training loss that gets scaled and backpropagated.
pub fn reduce_losses(losses: &LossMap) -> Result<(BTreeMap<String, f32>, f32), ModelError> {
    let mut reduced = BTreeMap::new();
    for (name, value) in losses {
        reduced.insert(name.clone(), value.mean(name)?);
    }
    let total = reduced.values().sum();
    Ok((reduced, total))
}

/// Named parameter buffers of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, Vec<f32>>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.0.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        self.0.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Vec<f32>)> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize into an opaque blob for checkpointing.
    pub fn to_blob(&self) -> Result<serde_json::Value, ModelError> {
        serde_json::to_value(self).map_err(|e| ModelError::state(e.to_string()))
    }

    /// Replace every buffer with the matching one from `blob`.
    ///
    /// Fails without modifying `self` if a buffer is missing, unexpected or
    /// has a different length.
    pub fn load_blob(&mut self, blob: &serde_json::Value) -> Result<(), ModelError> {
        let loaded: Parameters =
            serde_json::from_value(blob.clone()).map_err(|e| ModelError::state(e.to_string()))?;
        self.load_from(loaded)
    }

    pub fn load_from(&mut self, other: Parameters) -> Result<(), ModelError> {
        for (name, values) in &self.0 {
            match other.0.get(name) {
                None => return Err(ModelError::state(format!("missing parameter {name}"))),
                Some(v) if v.len() != values.len() => {
                    return Err(ModelError::state(format!(
                        "parameter {name} has {} elements, expected {}",
                        v.len(),
                        values.len()
                    )));
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = other.0.keys().find(|k| !self.0.contains_key(*k)) {
            return Err(ModelError::state(format!("unexpected parameter {extra}")));
        }
        self.0 = other.0;
        Ok(())
    }
}

/// Gradient buffers, shaped like the [`Parameters`] they belong to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gradients(BTreeMap<String, Vec<f32>>);

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.0.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.0.iter()
    }

    /// Multiply every element in place.
    pub fn scale_by(&mut self, factor: f32) {
        for values in self.0.values_mut() {
            for v in values.iter_mut() {
                *v *= factor;
            }
        }
    }

    pub fn all_finite(&self) -> bool {
        self.0.values().flatten().all(|v| v.is_finite())
    }
}

/// Training loss after loss scaling, as handed to [`Model::backward`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledLoss {
    /// `loss * scale`.
    pub value: f32,
    pub scale: f32,
}

/// The learnable model. Its architecture and loss are out of scope; the
/// scheduler only sequences these calls.
pub trait Model {
    type Inputs;
    type Targets;

    fn set_mode(&mut self, mode: Mode);

    /// Forward in train mode, caching whatever `backward` needs.
    fn forward_train(&mut self, batch: &Batch<Self::Inputs, Self::Targets>)
    -> Result<LossMap, ModelError>;

    /// Gradients of `loss.value` w.r.t. the parameters, for the most recent
    /// `forward_train`.
    fn backward(&mut self, loss: &ScaledLoss) -> Result<Gradients, ModelError>;

    /// Forward in test mode without gradient tracking. Every output is
    /// batch-shaped along its leading dimension.
    fn forward_test(
        &self,
        batch: &Batch<Self::Inputs, Self::Targets>,
    ) -> Result<BatchOutput, ModelError>;

    fn parameters(&self) -> &Parameters;

    fn parameters_mut(&mut self) -> &mut Parameters;
}

/// Applies gradient updates. The update rule itself is the implementor's.
pub trait Optimizer: Send {
    fn zero_grad(&mut self);

    fn step(&mut self, params: &mut Parameters, grads: &Gradients) -> Result<(), OptimizerError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> Result<serde_json::Value, OptimizerError>;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<(), OptimizerError>;
}

/// Finite sequence of batches, restarted at the beginning of every epoch.
pub trait DataSupply<I, T> {
    /// Number of batches one epoch is expected to yield.
    fn batches_per_epoch(&self) -> usize;

    /// Rewind to the first batch of `epoch`.
    fn start_epoch(&mut self, epoch: usize) -> Result<(), DataError>;

    /// Next batch of the current epoch, `None` once exhausted.
    fn next_batch(&mut self) -> Option<Result<Batch<I, T>, DataError>>;
}

impl<I, T, S: DataSupply<I, T> + ?Sized> DataSupply<I, T> for Box<S> {
    fn batches_per_epoch(&self) -> usize {
        (**self).batches_per_epoch()
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<(), DataError> {
        (**self).start_epoch(epoch)
    }

    fn next_batch(&mut self) -> Option<Result<Batch<I, T>, DataError>> {
        (**self).next_batch()
    }
}

/// Turns per-sample model outputs into per-key metric sequences.
pub trait Evaluator {
    fn evaluate(&mut self, outputs: &[EvalRecord], start_index: usize) -> MetricBatch;
}
