//! Error types for the epochal training core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, checkpoint storage, data supply, model and
//! optimizer collaborators, and evaluation metrics. Gradient overflow is
//! handled inside the loss scaler and never surfaces as an error value.

use std::path::PathBuf;

/// Top-level error type for a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Run interrupted at epoch {epoch}, iteration {iteration}")]
    Interrupted { epoch: usize, iteration: usize },
}

impl TrainError {
    /// Whether the run stopped because of an external interrupt rather than a fault.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TrainError::Interrupted { .. })
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No device specified; pass --gpu or set `device` in the config")]
    NoDevice,

    #[error("Invalid device specification '{spec}': {reason}")]
    InvalidDevice { spec: String, reason: String },

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Errors from the checkpoint manager.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("No checkpoint found at {path}")]
    NotFound { path: PathBuf },

    #[error("Checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint storage failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a data-supply collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Data supply exhausted in epoch {epoch}: expected {expected} batches, got {actual}")]
    Exhausted {
        epoch: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Data source failure: {message}")]
    Source { message: String },
}

impl DataError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Source {
            message: msg.into(),
        }
    }
}

/// Errors from the model collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Forward pass failed: {message}")]
    Forward { message: String },

    #[error("Backward pass failed: {message}")]
    Backward { message: String },

    #[error("Loss component '{name}' cannot be reduced: {reason}")]
    InvalidLoss { name: String, reason: String },

    #[error("Model state error: {message}")]
    State { message: String },
}

impl ModelError {
    pub fn forward(msg: impl Into<String>) -> Self {
        Self::Forward {
            message: msg.into(),
        }
    }

    pub fn backward(msg: impl Into<String>) -> Self {
        Self::Backward {
            message: msg.into(),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State {
            message: msg.into(),
        }
    }
}

/// Errors from the optimizer collaborator.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("Parameter update failed: {message}")]
    Step { message: String },

    #[error("Optimizer state error: {message}")]
    State { message: String },
}

/// Errors from evaluation output handling.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("Output '{key}' has batch size {actual}, expected {expected}")]
    ShapeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Accumulator is at sample {expected}, but batch starts at {actual}")]
    IndexMismatch { expected: usize, actual: usize },
}
