//! # epochal-core — resumable epoch/iteration orchestration for training loops
//!
//! The crate drives a supervised training run without knowing anything about
//! the model, optimizer or data it is given:
//!
//! 1. **Scheduler** — epoch loop: learning rate → train pass → evaluation
//!    pass → metric means → checkpoint, with cancellation between iterations
//! 2. **Loss scaling** — dynamic loss-scale controller for mixed precision,
//!    or a pinned 1.0 scale for full precision
//! 3. **Metric aggregation** — per-sample evaluation outputs accumulated in
//!    global sample order and summarized per epoch
//! 4. **Checkpoints** — atomic per-epoch snapshots with a hashed manifest
//! 5. **Timing** — running-average stopwatches behind the progress line

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Collaborator contracts
pub mod collaborators;
pub mod prefetch;
pub mod reference;
pub mod schedule;
pub mod sinks;

// Core
pub mod checkpoint;
pub mod metrics;
pub mod scaler;
pub mod scheduler;
pub mod timer;

pub use checkpoint::{CheckpointManager, CheckpointRecord, TrainingState};
pub use collaborators::{
    Batch, DataSupply, Evaluator, Gradients, LossMap, LossValue, Mode, Model, Optimizer,
    Parameters, ScaledLoss,
};
pub use config::{ConfigOverrides, TrainConfig, load_config};
pub use error::{
    CheckpointError, ConfigError, DataError, MetricError, ModelError, OptimizerError, TrainError,
};
pub use metrics::{EvalAccumulator, EvalRecord, MetricValue, RunHistory};
pub use scaler::{DynamicLossScaler, GradScaling, LossScaleConfig, PrecisionStrategy};
pub use scheduler::{EpochScheduler, SchedulerContext, SchedulerState};
pub use timer::Timer;
