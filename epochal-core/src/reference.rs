//! Small reference collaborators: an in-memory data supply, a linear
//! regression model and momentum SGD.
//!
//! They exist to drive the scheduler end-to-end (CLI demo runs, integration
//! tests); they are not meant as a model library.

use crate::collaborators::{
    Batch, DataSupply, Gradients, LossMap, LossValue, Mode, Model, Optimizer, Parameters,
    ScaledLoss,
};
use crate::error::{DataError, ModelError, OptimizerError};
use crate::metrics::{BatchArray, BatchOutput};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serves a fixed list of batches every epoch, optionally reshuffled.
#[derive(Debug, Clone)]
pub struct InMemorySupply<I, T> {
    batches: Vec<Batch<I, T>>,
    order: Vec<usize>,
    cursor: usize,
    shuffle_seed: Option<u64>,
    declared_len: Option<usize>,
}

impl<I: Clone, T: Clone> InMemorySupply<I, T> {
    pub fn new(batches: Vec<Batch<I, T>>) -> Self {
        let order = (0..batches.len()).collect();
        Self {
            batches,
            order,
            cursor: 0,
            shuffle_seed: None,
            declared_len: None,
        }
    }

    /// Reshuffle batch order at every epoch, deterministically per seed and epoch.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Advertise a different per-epoch batch count than is actually held.
    pub fn with_declared_len(mut self, n: usize) -> Self {
        self.declared_len = Some(n);
        self
    }
}

impl<I: Clone, T: Clone> DataSupply<I, T> for InMemorySupply<I, T> {
    fn batches_per_epoch(&self) -> usize {
        self.declared_len.unwrap_or(self.batches.len())
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<(), DataError> {
        self.cursor = 0;
        self.order = (0..self.batches.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed ^ epoch as u64);
            self.order.shuffle(&mut rng);
        }
        Ok(())
    }

    fn next_batch(&mut self) -> Option<Result<Batch<I, T>, DataError>> {
        let idx = *self.order.get(self.cursor)?;
        self.cursor += 1;
        Some(Ok(self.batches[idx].clone()))
    }
}

/// Feature rows of one batch.
pub type Features = Vec<Vec<f32>>;

/// `y = x·w + b` trained with mean squared error.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    params: Parameters,
    mode: Mode,
    cache: Option<(Features, Vec<f32>)>,
}

impl LinearRegression {
    pub fn new(dim: usize) -> Self {
        let mut params = Parameters::new();
        params.insert("weight", vec![0.0; dim]);
        params.insert("bias", vec![0.0]);
        Self {
            params,
            mode: Mode::Train,
            cache: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.params.get("weight").map_or(0, <[f32]>::len)
    }

    fn predict(&self, x: &[f32]) -> Result<f32, ModelError> {
        let w = self.params.get("weight").unwrap_or(&[]);
        let b = self.params.get("bias").and_then(|b| b.first()).copied().unwrap_or(0.0);
        if x.len() != w.len() {
            return Err(ModelError::forward(format!(
                "expected {} features, got {}",
                w.len(),
                x.len()
            )));
        }
        Ok(x.iter().zip(w).map(|(a, b)| a * b).sum::<f32>() + b)
    }

    fn residuals(&self, batch: &Batch<Features, Vec<f32>>) -> Result<Vec<f32>, ModelError> {
        if batch.inputs.len() != batch.targets.len() {
            return Err(ModelError::forward(format!(
                "{} input rows but {} targets",
                batch.inputs.len(),
                batch.targets.len()
            )));
        }
        batch
            .inputs
            .iter()
            .zip(&batch.targets)
            .map(|(x, y)| self.predict(x).map(|p| p - y))
            .collect()
    }
}

impl Model for LinearRegression {
    type Inputs = Features;
    type Targets = Vec<f32>;

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        if mode == Mode::Test {
            self.cache = None;
        }
    }

    fn forward_train(&mut self, batch: &Batch<Features, Vec<f32>>) -> Result<LossMap, ModelError> {
        if self.mode != Mode::Train {
            return Err(ModelError::forward("forward_train called in test mode"));
        }
        let residuals = self.residuals(batch)?;
        let squared = residuals.iter().map(|r| r * r).collect();
        self.cache = Some((batch.inputs.clone(), residuals));
        Ok(LossMap::from([("mse".to_string(), LossValue::PerSample(squared))]))
    }

    fn backward(&mut self, loss: &ScaledLoss) -> Result<Gradients, ModelError> {
        let (inputs, residuals) = self
            .cache
            .take()
            .ok_or_else(|| ModelError::backward("backward called without a forward pass"))?;
        let n = residuals.len().max(1) as f32;
        let mut dw = vec![0.0f32; self.dim()];
        let mut db = 0.0f32;
        for (x, r) in inputs.iter().zip(&residuals) {
            let coeff = loss.scale * 2.0 * r / n;
            for (g, xi) in dw.iter_mut().zip(x) {
                *g += coeff * xi;
            }
            db += coeff;
        }
        let mut grads = Gradients::new();
        grads.insert("weight", dw);
        grads.insert("bias", vec![db]);
        Ok(grads)
    }

    fn forward_test(&self, batch: &Batch<Features, Vec<f32>>) -> Result<BatchOutput, ModelError> {
        let residuals = self.residuals(batch)?;
        let preds = batch
            .targets
            .iter()
            .zip(&residuals)
            .map(|(y, r)| f64::from(y + r))
            .collect();
        Ok(BatchOutput::from([
            ("pred".to_string(), BatchArray::Scalars(preds)),
            (
                "abs_err".to_string(),
                BatchArray::Scalars(residuals.iter().map(|r| f64::from(r.abs())).collect()),
            ),
        ]))
    }

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SgdState {
    lr: f64,
    momentum: f64,
    steps: u64,
    velocity: BTreeMap<String, Vec<f32>>,
}

/// Stochastic gradient descent with classical momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    state: SgdState,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64) -> Self {
        Self {
            state: SgdState {
                lr,
                momentum,
                ..SgdState::default()
            },
        }
    }

    pub fn steps(&self) -> u64 {
        self.state.steps
    }
}

impl Optimizer for Sgd {
    // Gradients are handed over by value each step; nothing accumulates here.
    fn zero_grad(&mut self) {}

    fn step(&mut self, params: &mut Parameters, grads: &Gradients) -> Result<(), OptimizerError> {
        let lr = self.state.lr as f32;
        let momentum = self.state.momentum as f32;
        for (name, values) in params.iter_mut() {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            if grad.len() != values.len() {
                return Err(OptimizerError::Step {
                    message: format!(
                        "gradient for {name} has {} elements, parameter has {}",
                        grad.len(),
                        values.len()
                    ),
                });
            }
            let velocity = self
                .state
                .velocity
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; values.len()]);
            for ((p, v), g) in values.iter_mut().zip(velocity.iter_mut()).zip(grad) {
                *v = momentum * *v + g;
                *p -= lr * *v;
            }
        }
        self.state.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.state.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.state.lr = lr;
    }

    fn state_dict(&self) -> Result<serde_json::Value, OptimizerError> {
        serde_json::to_value(&self.state).map_err(|e| OptimizerError::State {
            message: e.to_string(),
        })
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<(), OptimizerError> {
        self.state = serde_json::from_value(state.clone()).map_err(|e| OptimizerError::State {
            message: e.to_string(),
        })?;
        Ok(())
    }
}
