//! Epoch/iteration scheduler.
//!
//! Drives one run: per epoch it applies the learning rate, trains over every
//! batch of the training supply, evaluates over the evaluation supply,
//! publishes the metric means, and only then writes the epoch's checkpoint.
//! Everything mutable during a run lives in [`SchedulerContext`], owned by the
//! scheduler, so several runs can coexist in one process.

use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::collaborators::{DataSupply, Evaluator, Mode, Model, Optimizer, reduce_losses};
use crate::error::{DataError, TrainError};
use crate::metrics::{EpochSummary, EvalAccumulator, RunHistory, split_batch};
use crate::scaler::{FullPrecision, GradScaling, PrecisionStrategy, StepOutcome};
use crate::schedule::{Constant, LrSchedule};
use crate::sinks::{NullScalars, ProgressRecord, ProgressSink, ScalarSink, TracingProgress};
use crate::timer::IterationTimers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A data supply the scheduler can own and move across threads.
pub type BoxedSupply<I, T> = Box<dyn DataSupply<I, T> + Send>;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Init,
    TrainingEpoch,
    EvaluatingEpoch,
    Checkpointing,
    Done,
    Failed,
}

impl SchedulerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Done | SchedulerState::Failed)
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulerState::Init => "init",
            SchedulerState::TrainingEpoch => "training_epoch",
            SchedulerState::EvaluatingEpoch => "evaluating_epoch",
            SchedulerState::Checkpointing => "checkpointing",
            SchedulerState::Done => "done",
            SchedulerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Mutable state of one run.
#[derive(Debug, Clone)]
pub struct SchedulerContext {
    /// Epoch about to run, or running.
    pub epoch: usize,
    /// Dashboard step of the next training iteration.
    pub global_step: u64,
    pub state: SchedulerState,
    /// Never reset mid-run: averages cover the whole run.
    pub timers: IterationTimers,
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            state: SchedulerState::Init,
            timers: IterationTimers::default(),
        }
    }
}

/// Totals of one training pass.
struct TrainPass {
    mean_loss: f64,
    skipped_steps: u64,
}

pub struct EpochScheduler<M: Model> {
    model: M,
    optimizer: Box<dyn Optimizer>,
    train_data: BoxedSupply<M::Inputs, M::Targets>,
    eval_data: BoxedSupply<M::Inputs, M::Targets>,
    lr_schedule: Box<dyn LrSchedule>,
    evaluator: Option<Box<dyn Evaluator + Send>>,
    scaler: Box<dyn GradScaling>,
    checkpoints: CheckpointManager,
    progress: Box<dyn ProgressSink>,
    scalars: Box<dyn ScalarSink>,
    end_epoch: usize,
    cancel: CancellationToken,
    ctx: SchedulerContext,
    history: RunHistory,
}

impl<M: Model> EpochScheduler<M> {
    /// A scheduler running epochs `0..end_epoch` in full precision with the
    /// optimizer's current learning rate, logging progress through `tracing`.
    pub fn new(
        model: M,
        optimizer: Box<dyn Optimizer>,
        train_data: BoxedSupply<M::Inputs, M::Targets>,
        eval_data: BoxedSupply<M::Inputs, M::Targets>,
        checkpoints: CheckpointManager,
        end_epoch: usize,
    ) -> Self {
        let lr = optimizer.learning_rate();
        Self {
            model,
            optimizer,
            train_data,
            eval_data,
            lr_schedule: Box::new(Constant(lr)),
            evaluator: None,
            scaler: Box::new(FullPrecision),
            checkpoints,
            progress: Box::new(TracingProgress),
            scalars: Box::new(NullScalars),
            end_epoch,
            cancel: CancellationToken::new(),
            ctx: SchedulerContext::default(),
            history: RunHistory::default(),
        }
    }

    pub fn with_lr_schedule(mut self, schedule: impl LrSchedule + 'static) -> Self {
        self.lr_schedule = Box::new(schedule);
        self
    }

    pub fn with_precision(mut self, precision: PrecisionStrategy) -> Self {
        self.scaler = precision.into_scaler();
        self
    }

    pub fn with_scaler(mut self, scaler: Box<dyn GradScaling>) -> Self {
        self.scaler = scaler;
        self
    }

    /// Post-process per-sample outputs before aggregation. Without an
    /// evaluator the raw test outputs are aggregated.
    pub fn with_evaluator(mut self, evaluator: impl Evaluator + Send + 'static) -> Self {
        self.evaluator = Some(Box::new(evaluator));
        self
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(sink);
        self
    }

    pub fn with_scalars(mut self, sink: impl ScalarSink + 'static) -> Self {
        self.scalars = Box::new(sink);
        self
    }

    /// Token checked between iterations; cancelling it fails the run without
    /// writing a checkpoint for the interrupted epoch.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn state(&self) -> SchedulerState {
        self.ctx.state
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn current_scale(&self) -> f32 {
        self.scaler.current_scale()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Restore a saved state. The run continues at the epoch after the saved one.
    pub fn resume_from(&mut self, state: &TrainingState) -> Result<(), TrainError> {
        self.model
            .parameters_mut()
            .load_blob(&state.model_parameters)?;
        self.optimizer.load_state_dict(&state.optimizer_state)?;
        self.ctx.epoch = state.current_epoch + 1;
        self.ctx.global_step = (self.ctx.epoch * self.train_data.batches_per_epoch()) as u64;
        tracing::info!(
            loaded_epoch = state.current_epoch,
            next_epoch = self.ctx.epoch,
            global_step = self.ctx.global_step,
            "Resumed from checkpoint"
        );
        Ok(())
    }

    /// Resume from the newest snapshot in the checkpoint directory.
    pub fn resume_latest(&mut self) -> Result<(), TrainError> {
        let state = self.checkpoints.load_latest()?;
        self.resume_from(&state)
    }

    /// Run the remaining epochs.
    ///
    /// On success the scheduler ends in `Done`; on any error in `Failed`, with
    /// the last completed epoch's checkpoint left as the resume point.
    pub fn run(&mut self) -> Result<RunHistory, TrainError> {
        let started = Instant::now();
        tracing::info!(
            start_epoch = self.ctx.epoch,
            end_epoch = self.end_epoch,
            mixed_precision = self.scaler.is_enabled(),
            "Training started"
        );

        let outcome = self.run_epochs();
        self.scalars.flush();
        self.history.total_training_time_secs += started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                self.ctx.state = SchedulerState::Done;
                tracing::info!(
                    epochs = self.history.epochs_completed(),
                    best_epoch = ?self.history.best_epoch,
                    secs = self.history.total_training_time_secs,
                    "Training finished"
                );
                Ok(self.history.clone())
            }
            Err(e) => {
                let during = self.ctx.state;
                self.ctx.state = SchedulerState::Failed;
                if e.is_interrupt() {
                    tracing::warn!(epoch = self.ctx.epoch, %during, "Training interrupted");
                } else {
                    tracing::error!(epoch = self.ctx.epoch, %during, error = %e, "Training failed");
                }
                Err(e)
            }
        }
    }

    fn run_epochs(&mut self) -> Result<(), TrainError> {
        while self.ctx.epoch < self.end_epoch {
            let epoch = self.ctx.epoch;
            self.check_cancelled(0)?;

            let lr = self.lr_schedule.lr_at(epoch);
            self.optimizer.set_learning_rate(lr);

            self.ctx.state = SchedulerState::TrainingEpoch;
            let train = self.train_epoch(epoch, lr)?;

            self.ctx.state = SchedulerState::EvaluatingEpoch;
            let eval_means = self.evaluate_epoch(epoch)?;
            for (key, mean) in &eval_means {
                self.scalars
                    .add_scalar(&format!("eval_acc/{key}"), *mean, epoch as u64);
                tracing::info!(epoch, metric = %key, mean, "Evaluation");
            }

            self.ctx.state = SchedulerState::Checkpointing;
            let state = TrainingState {
                current_epoch: epoch,
                model_parameters: self.model.parameters().to_blob()?,
                optimizer_state: self.optimizer.state_dict()?,
            };
            self.checkpoints.save(&state, epoch)?;

            self.history.record_epoch(EpochSummary {
                epoch,
                mean_train_loss: train.mean_loss,
                eval_means,
                skipped_steps: train.skipped_steps,
            });
            self.ctx.epoch += 1;
        }
        Ok(())
    }

    fn check_cancelled(&self, iteration: usize) -> Result<(), TrainError> {
        if self.cancel.is_cancelled() {
            return Err(TrainError::Interrupted {
                epoch: self.ctx.epoch,
                iteration,
            });
        }
        Ok(())
    }

    fn train_epoch(&mut self, epoch: usize, lr: f64) -> Result<TrainPass, TrainError> {
        self.model.set_mode(Mode::Train);
        self.train_data.start_epoch(epoch)?;
        let expected = self.train_data.batches_per_epoch();

        let mut iteration = 0;
        let mut loss_sum = 0.0f64;
        let mut skipped = 0u64;

        self.ctx.timers.total.tic();
        self.ctx.timers.read.tic();
        loop {
            self.check_cancelled(iteration)?;
            let Some(batch) = self.train_data.next_batch() else {
                break;
            };
            let batch = batch?;
            self.ctx.timers.read.toc();
            self.ctx.timers.compute.tic();

            if iteration == expected {
                tracing::warn!(epoch, expected, "Training supply yielded more batches than announced");
            }

            self.optimizer.zero_grad();
            let losses = self.model.forward_train(&batch)?;
            let (components, total) = reduce_losses(&losses)?;
            if !total.is_finite() {
                tracing::warn!(epoch, iteration, loss = total, "Non-finite training loss");
            }
            let scaled = self.scaler.scale(total);
            let grads = self.model.backward(&scaled)?;
            let outcome = self.scaler.step(
                self.optimizer.as_mut(),
                self.model.parameters_mut(),
                grads,
            )?;
            self.scaler.update();
            self.ctx.timers.compute.toc();

            if outcome == StepOutcome::Skipped {
                skipped += 1;
                tracing::debug!(
                    epoch,
                    iteration,
                    scale = self.scaler.current_scale(),
                    "Optimizer step skipped"
                );
            }

            let losses: BTreeMap<String, f64> = components
                .into_iter()
                .map(|(name, value)| (name, f64::from(value)))
                .collect();
            self.report_iteration(epoch, iteration, expected, lr, losses, f64::from(total));

            loss_sum += f64::from(total);
            iteration += 1;
            self.ctx.global_step += 1;

            self.ctx.timers.total.toc();
            self.ctx.timers.total.tic();
            self.ctx.timers.read.tic();
        }

        if iteration < expected {
            return Err(DataError::Exhausted {
                epoch,
                expected,
                actual: iteration,
            }
            .into());
        }

        let mean_loss = if iteration == 0 {
            0.0
        } else {
            loss_sum / iteration as f64
        };
        tracing::info!(
            epoch,
            iterations = iteration,
            mean_loss,
            skipped_steps = skipped,
            scale = self.scaler.current_scale(),
            "Training pass complete"
        );
        Ok(TrainPass {
            mean_loss,
            skipped_steps: skipped,
        })
    }

    fn report_iteration(
        &mut self,
        epoch: usize,
        iteration: usize,
        expected: usize,
        lr: f64,
        losses: BTreeMap<String, f64>,
        total: f64,
    ) {
        let timers = &self.ctx.timers;
        let record = ProgressRecord {
            epoch,
            end_epoch: self.end_epoch,
            iteration,
            iterations_per_epoch: expected,
            lr,
            total_avg: timers.total.average_time(),
            compute_avg: timers.compute.average_time(),
            read_avg: timers.read.average_time(),
            hours_per_epoch: timers.hours_per_epoch(expected),
            losses,
        };
        self.progress.log_line(&record.to_string());

        let step = self.ctx.global_step;
        for (name, value) in &record.losses {
            self.scalars
                .add_scalar(&format!("train_loss/{name}"), *value, step);
        }
        self.scalars.add_scalar("train_loss/total_loss", total, step);
    }

    fn evaluate_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>, TrainError> {
        self.model.set_mode(Mode::Test);
        self.eval_data.start_epoch(epoch)?;
        let expected = self.eval_data.batches_per_epoch();

        let mut accumulator = EvalAccumulator::new();
        let mut sample_index = 0;
        let mut batches = 0;
        loop {
            self.check_cancelled(batches)?;
            let Some(batch) = self.eval_data.next_batch() else {
                break;
            };
            let batch = batch?;
            let output = self.model.forward_test(&batch)?;
            let records = split_batch(output)?;
            let n = records.len();
            sample_index = match self.evaluator.as_mut() {
                Some(evaluator) => {
                    let scored = evaluator.evaluate(&records, sample_index);
                    accumulator.merge(scored, sample_index, n)?
                }
                None => accumulator.accumulate(records, sample_index)?,
            };
            batches += 1;
        }

        if batches < expected {
            return Err(DataError::Exhausted {
                epoch,
                expected,
                actual: batches,
            }
            .into());
        }
        if batches > expected {
            tracing::warn!(epoch, expected, actual = batches, "Evaluation supply yielded more batches than announced");
        }

        tracing::debug!(epoch, samples = sample_index, "Evaluation pass complete");
        Ok(accumulator.summarize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Batch, Gradients, LossMap, LossValue, Parameters, ScaledLoss};
    use crate::error::{ModelError, OptimizerError};
    use crate::metrics::{BatchArray, BatchOutput, EvalRecord, MetricBatch, MetricValue};
    use crate::reference::InMemorySupply;
    use crate::scaler::{DynamicLossScaler, LossScaleConfig};
    use crate::sinks::RecordingSink;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Model whose loss and accuracy are scripted per call.
    #[derive(Default)]
    struct Scripted {
        params: Parameters,
        mode: Option<Mode>,
        /// `acc` outputs for successive `forward_test` calls.
        acc: Vec<Vec<f64>>,
        tests: std::cell::Cell<usize>,
        /// Gradient value returned for successive `backward` calls.
        grads: Vec<f32>,
        backwards: usize,
        fail_forward_at: Option<usize>,
        forwards: usize,
    }

    impl Scripted {
        fn new() -> Self {
            let mut params = Parameters::new();
            params.insert("w", vec![0.0]);
            Self {
                params,
                ..Self::default()
            }
        }
    }

    impl Model for Scripted {
        type Inputs = u32;
        type Targets = ();

        fn set_mode(&mut self, mode: Mode) {
            self.mode = Some(mode);
        }

        fn forward_train(&mut self, batch: &Batch<u32, ()>) -> Result<LossMap, ModelError> {
            assert_eq!(self.mode, Some(Mode::Train));
            self.forwards += 1;
            if self.fail_forward_at == Some(self.forwards) {
                return Err(ModelError::forward("scripted failure"));
            }
            Ok(LossMap::from([
                ("a".to_string(), LossValue::Scalar(batch.inputs as f32)),
                ("b".to_string(), LossValue::PerSample(vec![1.0, 3.0])),
            ]))
        }

        fn backward(&mut self, loss: &ScaledLoss) -> Result<Gradients, ModelError> {
            let g = self.grads.get(self.backwards).copied().unwrap_or(1.0);
            self.backwards += 1;
            let mut grads = Gradients::new();
            grads.insert("w", vec![g * loss.scale]);
            Ok(grads)
        }

        fn forward_test(&self, _batch: &Batch<u32, ()>) -> Result<BatchOutput, ModelError> {
            assert_eq!(self.mode, Some(Mode::Test));
            let call = self.tests.get();
            self.tests.set(call + 1);
            let acc = self.acc.get(call).cloned().unwrap_or_default();
            Ok(BatchOutput::from([("acc".to_string(), BatchArray::Scalars(acc))]))
        }

        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }
    }

    /// Counts applied steps and records learning rates.
    #[derive(Clone, Default)]
    struct Counting {
        lr: f64,
        applied: Arc<Mutex<Vec<f32>>>,
        lrs: Arc<Mutex<Vec<f64>>>,
    }

    impl Optimizer for Counting {
        fn zero_grad(&mut self) {}

        fn step(&mut self, params: &mut Parameters, grads: &Gradients) -> Result<(), OptimizerError> {
            let g = grads.get("w").map_or(0.0, |g| g[0]);
            self.applied.lock().unwrap().push(g);
            if let Some(w) = params.get_mut("w") {
                w[0] -= g;
            }
            Ok(())
        }

        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
            self.lrs.lock().unwrap().push(lr);
        }

        fn state_dict(&self) -> Result<serde_json::Value, OptimizerError> {
            Ok(serde_json::json!({ "lr": self.lr }))
        }

        fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<(), OptimizerError> {
            self.lr = state["lr"].as_f64().unwrap_or_default();
            Ok(())
        }
    }

    fn supply(n: usize) -> BoxedSupply<u32, ()> {
        Box::new(InMemorySupply::new(
            (0..n as u32).map(|i| Batch::new(i, ())).collect(),
        ))
    }

    fn scheduler(
        model: Scripted,
        opt: &Counting,
        dir: &TempDir,
        train: usize,
        eval: usize,
        end_epoch: usize,
    ) -> EpochScheduler<Scripted> {
        EpochScheduler::new(
            model,
            Box::new(opt.clone()),
            supply(train),
            supply(eval),
            CheckpointManager::new(dir.path()),
            end_epoch,
        )
    }

    #[test]
    fn test_epoch_sequence_and_scalars() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let mut model = Scripted::new();
        model.acc = vec![vec![1.0, 0.0], vec![1.0, 1.0]];
        let sink = RecordingSink::new();

        let mut sched = scheduler(model, &opt, &dir, 2, 1, 2)
            .with_lr_schedule(|epoch: usize| 0.1 / (epoch as f64 + 1.0))
            .with_progress(sink.clone())
            .with_scalars(sink.clone());
        let history = sched.run().unwrap();

        assert_eq!(sched.state(), SchedulerState::Done);
        assert_eq!(sched.context().epoch, 2);
        assert_eq!(sched.context().global_step, 4);
        assert_eq!(*opt.lrs.lock().unwrap(), vec![0.1, 0.05]);
        assert_eq!(opt.applied.lock().unwrap().len(), 4);

        let acc: Vec<(f64, u64)> = sink
            .scalars_for("eval_acc/acc")
            .into_iter()
            .map(|s| (s.value, s.step))
            .collect();
        assert_eq!(acc, vec![(0.5, 0), (1.0, 1)]);

        // loss a = batch index, loss b = mean(1, 3) = 2
        let totals: Vec<(f64, u64)> = sink
            .scalars_for("train_loss/total_loss")
            .into_iter()
            .map(|s| (s.value, s.step))
            .collect();
        assert_eq!(totals, vec![(2.0, 0), (3.0, 1), (2.0, 2), (3.0, 3)]);
        assert_eq!(sink.scalars_for("train_loss/b").len(), 4);

        let lines = sink.lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[3].starts_with("Epoch 1/2 itr 1/2: lr: 0.05"));
        assert!(lines[3].ends_with("loss_a: 1.0000 loss_b: 2.0000"));

        assert_eq!(history.epochs_completed(), 2);
        assert_eq!(history.epochs[0].mean_train_loss, 2.5);
        assert_eq!(sched.context().timers.compute.count(), 4);
        assert_eq!(sched.context().timers.total.count(), 4);

        let saved: Vec<usize> = sched.checkpoints().list().unwrap().iter().map(|r| r.epoch).collect();
        assert_eq!(saved, vec![0, 1]);
    }

    #[test]
    fn test_exhausted_train_supply_fails_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let short = InMemorySupply::new(vec![Batch::new(0u32, ())]).with_declared_len(3);
        let mut sched = EpochScheduler::new(
            Scripted::new(),
            Box::new(opt.clone()),
            Box::new(short),
            supply(1),
            CheckpointManager::new(dir.path()),
            1,
        );

        let err = sched.run().unwrap_err();
        assert!(matches!(
            err,
            TrainError::Data(DataError::Exhausted { expected: 3, actual: 1, .. })
        ));
        assert_eq!(sched.state(), SchedulerState::Failed);
        assert!(sched.checkpoints().latest().unwrap().is_none());
    }

    #[test]
    fn test_exhausted_eval_supply_is_fatal() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let short = InMemorySupply::new(Vec::<Batch<u32, ()>>::new()).with_declared_len(1);
        let mut sched = EpochScheduler::new(
            Scripted::new(),
            Box::new(opt.clone()),
            supply(2),
            Box::new(short),
            CheckpointManager::new(dir.path()),
            1,
        );
        assert!(sched.run().is_err());
        assert!(sched.checkpoints().latest().unwrap().is_none());
    }

    #[test]
    fn test_model_failure_keeps_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let mut model = Scripted::new();
        model.acc = vec![vec![1.0], vec![1.0]];
        // Third forward is the first iteration of epoch 1.
        model.fail_forward_at = Some(3);

        let mut sched = scheduler(model, &opt, &dir, 2, 1, 3);
        let err = sched.run().unwrap_err();
        assert!(matches!(err, TrainError::Model(_)));
        assert_eq!(sched.context().epoch, 1);

        let saved: Vec<usize> = sched.checkpoints().list().unwrap().iter().map(|r| r.epoch).collect();
        assert_eq!(saved, vec![0]);
    }

    #[test]
    fn test_cancellation_is_honored_between_iterations() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let token = CancellationToken::new();
        token.cancel();

        let mut sched = scheduler(Scripted::new(), &opt, &dir, 2, 1, 2).with_cancellation(token);
        let err = sched.run().unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(sched.state(), SchedulerState::Failed);
        assert!(opt.applied.lock().unwrap().is_empty());
        assert!(sched.checkpoints().latest().unwrap().is_none());
    }

    #[test]
    fn test_overflow_skips_one_update_under_mixed_precision() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let mut model = Scripted::new();
        model.grads = vec![1.0, f32::INFINITY, 1.0, 1.0];
        model.acc = vec![vec![1.0]; 2];

        let precision = PrecisionStrategy::MixedPrecision(DynamicLossScaler::new(LossScaleConfig {
            init_scale: 8.0,
            ..LossScaleConfig::default()
        }));
        let mut sched = scheduler(model, &opt, &dir, 2, 1, 2).with_precision(precision);
        let history = sched.run().unwrap();

        // Applied gradients are unscaled back to the raw value.
        assert_eq!(*opt.applied.lock().unwrap(), vec![1.0, 1.0, 1.0]);
        assert_eq!(sched.current_scale(), 4.0);
        assert_eq!(history.epochs[0].skipped_steps, 1);
        assert_eq!(history.epochs[1].skipped_steps, 0);
    }

    #[test]
    fn test_full_precision_never_skips() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let mut model = Scripted::new();
        model.grads = vec![f32::INFINITY, f32::NAN];
        model.acc = vec![vec![1.0]];

        let mut sched = scheduler(model, &opt, &dir, 2, 1, 1)
            .with_precision(PrecisionStrategy::from_flag(false, LossScaleConfig::default()));
        sched.run().unwrap();

        assert_eq!(opt.applied.lock().unwrap().len(), 2);
        assert_eq!(sched.current_scale(), 1.0);
    }

    #[test]
    fn test_resume_starts_after_saved_epoch() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let mut model = Scripted::new();
        model.acc = vec![vec![1.0]; 4];
        let mut first = scheduler(model, &opt, &dir, 2, 1, 2);
        first.run().unwrap();

        let mut model = Scripted::new();
        model.acc = vec![vec![0.0]; 4];
        let sink = RecordingSink::new();
        let mut second = scheduler(model, &opt, &dir, 2, 1, 3).with_scalars(sink.clone());
        second.resume_latest().unwrap();
        assert_eq!(second.context().epoch, 2);
        assert_eq!(second.context().global_step, 4);
        assert_eq!(second.model().parameters(), first.model().parameters());

        second.run().unwrap();
        let epochs: Vec<u64> = sink.scalars_for("eval_acc/acc").iter().map(|s| s.step).collect();
        assert_eq!(epochs, vec![2]);
        assert_eq!(sink.scalars_for("train_loss/total_loss")[0].step, 4);
    }

    struct Doubling;

    impl Evaluator for Doubling {
        fn evaluate(&mut self, outputs: &[EvalRecord], _start_index: usize) -> MetricBatch {
            let doubled = outputs
                .iter()
                .filter_map(|r| match r.get("acc") {
                    Some(MetricValue::Scalar(v)) => Some(MetricValue::Scalar(v * 2.0)),
                    _ => None,
                })
                .collect();
            MetricBatch::from([("acc2".to_string(), doubled)])
        }
    }

    #[test]
    fn test_evaluator_output_is_aggregated() {
        let dir = TempDir::new().unwrap();
        let opt = Counting::default();
        let mut model = Scripted::new();
        model.acc = vec![vec![1.0, 0.0], vec![1.0]];
        let sink = RecordingSink::new();

        let mut sched = scheduler(model, &opt, &dir, 1, 2, 1)
            .with_evaluator(Doubling)
            .with_scalars(sink.clone());
        let history = sched.run().unwrap();

        let means = &history.epochs[0].eval_means;
        assert!((means["acc2"] - 4.0 / 3.0).abs() < 1e-12);
        assert!(!means.contains_key("acc"));
    }
}
