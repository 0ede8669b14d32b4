//! Dynamic loss scaling for mixed-precision training.
//!
//! The loss is multiplied by `current_scale` before backpropagation so small
//! gradients stay representable in reduced precision. Each iteration runs
//! `scale` → backward → `step` → `update`: `step` inspects the scaled
//! gradients and skips the optimizer when they overflowed, `update` then backs
//! the scale off (RECOVERING) or, after a streak of clean iterations, grows it
//! again toward and past the requested initial scale (NORMAL).
//!
//! Precision is chosen once, up front, through [`PrecisionStrategy`]; the
//! scheduler only ever sees a `Box<dyn GradScaling>`.

use crate::collaborators::{Gradients, Optimizer, Parameters, ScaledLoss};
use crate::error::OptimizerError;
use serde::{Deserialize, Serialize};

/// Largest finite value of IEEE half precision.
pub const HALF_MAX: f32 = 65504.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaleConfig {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Clean iterations required before the scale grows.
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
    /// Consecutive overflows after which a warning is emitted.
    pub overflow_warn_streak: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            init_scale: 1024.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
            overflow_warn_streak: 50,
        }
    }
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    let defaults = LossScaleConfig::default();
    if !config.growth_factor.is_finite() {
        config.growth_factor = defaults.growth_factor;
    } else if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(config.backoff_factor > 0.0 && config.backoff_factor < 1.0) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 || !config.min_scale.is_finite() {
        config.min_scale = f32::MIN_POSITIVE;
    }
    if !config.max_scale.is_finite() {
        config.max_scale = defaults.max_scale.max(config.min_scale);
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    if config.overflow_warn_streak == 0 {
        config.overflow_warn_streak = 1;
    }
    if !(config.init_scale.is_finite() && config.init_scale > 0.0) {
        config.init_scale = defaults.init_scale;
    }
    config.init_scale = config
        .init_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

/// Decides whether a set of scaled gradients overflowed.
pub trait OverflowDetector: Send {
    fn detect_overflow(&self, grads: &Gradients) -> bool;
}

/// Flags any infinite or NaN element.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonFiniteDetector;

impl OverflowDetector for NonFiniteDetector {
    fn detect_overflow(&self, grads: &Gradients) -> bool {
        !grads.all_finite()
    }
}

/// Flags values that would not survive a cast to half precision, for models
/// that compute in `f32` but store gradients in `f16`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfRangeDetector;

impl OverflowDetector for HalfRangeDetector {
    fn detect_overflow(&self, grads: &Gradients) -> bool {
        grads
            .iter()
            .flat_map(|(_, values)| values.iter())
            .any(|v| !v.is_finite() || v.abs() > HALF_MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    /// Scale stable or growing.
    Normal,
    /// Scale was reduced after an overflow and sits below the requested scale.
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScaleState {
    pub current_scale: f32,
    pub scale_requested: f32,
}

/// What `step` did with the optimizer this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
}

/// The `scale` → `step` → `update` contract shared by both precisions.
pub trait GradScaling: Send {
    fn scale(&self, loss: f32) -> ScaledLoss;

    fn step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        params: &mut Parameters,
        grads: Gradients,
    ) -> Result<StepOutcome, OptimizerError>;

    fn update(&mut self);

    fn current_scale(&self) -> f32;

    fn mode(&self) -> ScaleMode;

    fn is_enabled(&self) -> bool;
}

/// Full precision: scale pinned to 1.0, every step applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPrecision;

impl GradScaling for FullPrecision {
    fn scale(&self, loss: f32) -> ScaledLoss {
        ScaledLoss {
            value: loss,
            scale: 1.0,
        }
    }

    fn step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        params: &mut Parameters,
        grads: Gradients,
    ) -> Result<StepOutcome, OptimizerError> {
        optimizer.step(params, &grads)?;
        Ok(StepOutcome::Applied)
    }

    fn update(&mut self) {}

    fn current_scale(&self) -> f32 {
        1.0
    }

    fn mode(&self) -> ScaleMode {
        ScaleMode::Normal
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Dynamic loss-scale controller for mixed precision.
pub struct DynamicLossScaler {
    config: LossScaleConfig,
    state: LossScaleState,
    detector: Box<dyn OverflowDetector>,
    mode: ScaleMode,
    stable_steps: usize,
    overflow_streak: usize,
    /// Overflow verdict of the last `step`, consumed by `update`.
    pending: Option<bool>,
    skipped_total: u64,
    streak_warnings: u64,
}

impl std::fmt::Debug for DynamicLossScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLossScaler")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("stable_steps", &self.stable_steps)
            .field("overflow_streak", &self.overflow_streak)
            .finish_non_exhaustive()
    }
}

impl DynamicLossScaler {
    pub fn new(config: LossScaleConfig) -> Self {
        Self::with_detector(config, Box::new(NonFiniteDetector))
    }

    pub fn with_detector(config: LossScaleConfig, detector: Box<dyn OverflowDetector>) -> Self {
        let config = sanitize_config(config);
        Self {
            state: LossScaleState {
                current_scale: config.init_scale,
                scale_requested: config.init_scale,
            },
            config,
            detector,
            mode: ScaleMode::Normal,
            stable_steps: 0,
            overflow_streak: 0,
            pending: None,
            skipped_total: 0,
            streak_warnings: 0,
        }
    }

    pub fn state(&self) -> LossScaleState {
        self.state
    }

    pub fn config(&self) -> &LossScaleConfig {
        &self.config
    }

    pub fn overflow_streak(&self) -> usize {
        self.overflow_streak
    }

    /// Optimizer updates skipped so far in this run.
    pub fn skipped_steps(&self) -> u64 {
        self.skipped_total
    }

    /// Persistent-overflow warnings emitted so far.
    pub fn streak_warnings(&self) -> u64 {
        self.streak_warnings
    }

    fn back_off(&mut self) {
        let before = self.state.current_scale;
        self.state.current_scale =
            (before * self.config.backoff_factor).max(self.config.min_scale);
        self.stable_steps = 0;
        self.overflow_streak += 1;
        self.mode = ScaleMode::Recovering;

        tracing::debug!(
            from = before,
            to = self.state.current_scale,
            streak = self.overflow_streak,
            "Gradient overflow, reducing loss scale"
        );
        if self.overflow_streak % self.config.overflow_warn_streak == 0 {
            self.streak_warnings += 1;
            tracing::warn!(
                streak = self.overflow_streak,
                scale = self.state.current_scale,
                "Loss scale has not recovered after {} consecutive overflows",
                self.overflow_streak
            );
        }
        if before > self.config.min_scale && self.state.current_scale <= self.config.min_scale {
            tracing::warn!(
                min_scale = self.config.min_scale,
                "Loss scale reached its floor"
            );
        }
    }

    fn grow(&mut self) {
        self.overflow_streak = 0;
        self.stable_steps += 1;
        if self.stable_steps >= self.config.growth_interval {
            self.stable_steps = 0;
            self.state.current_scale =
                (self.state.current_scale * self.config.growth_factor).min(self.config.max_scale);
            tracing::debug!(scale = self.state.current_scale, "Loss scale grown");
        }
        if self.state.current_scale >= self.state.scale_requested {
            self.mode = ScaleMode::Normal;
        }
    }
}

impl GradScaling for DynamicLossScaler {
    fn scale(&self, loss: f32) -> ScaledLoss {
        ScaledLoss {
            value: loss * self.state.current_scale,
            scale: self.state.current_scale,
        }
    }

    fn step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        params: &mut Parameters,
        mut grads: Gradients,
    ) -> Result<StepOutcome, OptimizerError> {
        let overflow = self.detector.detect_overflow(&grads);
        self.pending = Some(overflow);
        if overflow {
            self.skipped_total += 1;
            return Ok(StepOutcome::Skipped);
        }
        grads.scale_by(1.0 / self.state.current_scale);
        optimizer.step(params, &grads)?;
        Ok(StepOutcome::Applied)
    }

    fn update(&mut self) {
        match self.pending.take() {
            Some(true) => self.back_off(),
            Some(false) => self.grow(),
            None => tracing::debug!("Loss scale update without a preceding step"),
        }
    }

    fn current_scale(&self) -> f32 {
        self.state.current_scale
    }

    fn mode(&self) -> ScaleMode {
        self.mode
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Precision selected once at startup and handed to the scheduler.
#[derive(Debug)]
pub enum PrecisionStrategy {
    FullPrecision,
    MixedPrecision(DynamicLossScaler),
}

impl PrecisionStrategy {
    /// Strategy for the `mixed` flag: a default-detector controller when
    /// enabled, full precision otherwise.
    pub fn from_flag(mixed: bool, config: LossScaleConfig) -> Self {
        if mixed {
            Self::MixedPrecision(DynamicLossScaler::new(config))
        } else {
            Self::FullPrecision
        }
    }

    pub fn into_scaler(self) -> Box<dyn GradScaling> {
        match self {
            Self::FullPrecision => Box::new(FullPrecision),
            Self::MixedPrecision(controller) => Box::new(controller),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingOptimizer {
        applied: Vec<usize>,
        calls: usize,
        last_grad: Option<f32>,
    }

    impl Optimizer for CountingOptimizer {
        fn zero_grad(&mut self) {}

        fn step(&mut self, _params: &mut Parameters, grads: &Gradients) -> Result<(), OptimizerError> {
            self.applied.push(self.calls);
            self.last_grad = grads.get("w").map(|g| g[0]);
            Ok(())
        }

        fn learning_rate(&self) -> f64 {
            0.1
        }

        fn set_learning_rate(&mut self, _lr: f64) {}

        fn state_dict(&self) -> Result<serde_json::Value, OptimizerError> {
            Ok(serde_json::Value::Null)
        }

        fn load_state_dict(&mut self, _state: &serde_json::Value) -> Result<(), OptimizerError> {
            Ok(())
        }
    }

    fn grads(value: f32) -> Gradients {
        let mut g = Gradients::new();
        g.insert("w", vec![value]);
        g
    }

    fn run_iterations(
        scaler: &mut dyn GradScaling,
        opt: &mut CountingOptimizer,
        overflow_at: usize,
        n: usize,
    ) -> Vec<f32> {
        let mut params = Parameters::new();
        let mut scales = Vec::new();
        for i in 0..n {
            opt.calls = i;
            let g = if i == overflow_at {
                grads(f32::INFINITY)
            } else {
                grads(scaler.current_scale())
            };
            scaler.step(opt, &mut params, g).unwrap();
            scaler.update();
            scales.push(scaler.current_scale());
        }
        scales
    }

    #[test]
    fn test_overflow_skips_exactly_that_iteration() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig::default());
        let mut opt = CountingOptimizer::default();
        let before = scaler.current_scale();

        let scales = run_iterations(&mut scaler, &mut opt, 3, 10);

        assert_eq!(opt.applied, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
        assert!(scales[3] < before);
        assert!(scales[3] < scales[2]);
        assert_eq!(scaler.skipped_steps(), 1);
    }

    #[test]
    fn test_step_unscales_before_update() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 8.0,
            ..LossScaleConfig::default()
        });
        let mut opt = CountingOptimizer::default();
        let mut params = Parameters::new();
        scaler.step(&mut opt, &mut params, grads(4.0)).unwrap();
        assert_eq!(opt.last_grad, Some(0.5));
    }

    #[test]
    fn test_full_precision_never_skips() {
        let mut scaler = PrecisionStrategy::from_flag(false, LossScaleConfig::default()).into_scaler();
        let mut opt = CountingOptimizer::default();

        let scales = run_iterations(scaler.as_mut(), &mut opt, 3, 10);

        assert_eq!(opt.applied.len(), 10);
        assert!(scales.iter().all(|s| *s == 1.0));
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.scale(3.0).value, 3.0);
    }

    #[test]
    fn test_recovers_after_growth_interval() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 512.0,
            growth_interval: 2,
            ..LossScaleConfig::default()
        });
        let mut opt = CountingOptimizer::default();
        let mut params = Parameters::new();

        scaler.step(&mut opt, &mut params, grads(f32::NAN)).unwrap();
        scaler.update();
        assert_eq!(scaler.current_scale(), 256.0);
        assert_eq!(scaler.mode(), ScaleMode::Recovering);

        for _ in 0..2 {
            scaler.step(&mut opt, &mut params, grads(1.0)).unwrap();
            scaler.update();
        }
        assert_eq!(scaler.current_scale(), 512.0);
        assert_eq!(scaler.mode(), ScaleMode::Normal);

        for _ in 0..2 {
            scaler.step(&mut opt, &mut params, grads(1.0)).unwrap();
            scaler.update();
        }
        assert_eq!(scaler.current_scale(), 1024.0);
    }

    #[test]
    fn test_backoff_floors_at_min_scale() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 4.0,
            min_scale: 2.0,
            overflow_warn_streak: 2,
            ..LossScaleConfig::default()
        });
        let mut opt = CountingOptimizer::default();
        let mut params = Parameters::new();
        for _ in 0..5 {
            scaler.step(&mut opt, &mut params, grads(f32::INFINITY)).unwrap();
            scaler.update();
        }
        assert_eq!(scaler.current_scale(), 2.0);
        assert_eq!(scaler.overflow_streak(), 5);
        assert!(opt.applied.is_empty());
    }

    #[test]
    fn test_streak_warning_every_n_overflows() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 4.0,
            min_scale: 2.0,
            overflow_warn_streak: 2,
            ..LossScaleConfig::default()
        });
        let mut opt = CountingOptimizer::default();
        let mut params = Parameters::new();
        let mut warned_at = Vec::new();
        for i in 1..=5 {
            let before = scaler.streak_warnings();
            scaler.step(&mut opt, &mut params, grads(f32::INFINITY)).unwrap();
            scaler.update();
            if scaler.streak_warnings() > before {
                warned_at.push(i);
            }
        }
        assert_eq!(warned_at, vec![2, 4]);

        // A clean step ends the streak; the next overflow starts counting again.
        scaler.step(&mut opt, &mut params, grads(1.0)).unwrap();
        scaler.update();
        scaler.step(&mut opt, &mut params, grads(f32::INFINITY)).unwrap();
        scaler.update();
        assert_eq!(scaler.overflow_streak(), 1);
        assert_eq!(scaler.streak_warnings(), 2);
    }

    #[test]
    fn test_update_without_step_keeps_scale() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig::default());
        scaler.update();
        assert_eq!(scaler.current_scale(), 1024.0);
    }

    #[test]
    fn test_half_range_detector() {
        let detector = HalfRangeDetector;
        assert!(!detector.detect_overflow(&grads(60000.0)));
        assert!(detector.detect_overflow(&grads(70000.0)));
        assert!(detector.detect_overflow(&grads(f32::NAN)));
    }

    #[test]
    fn test_sanitize_clamps_init_scale() {
        let scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 1e30,
            max_scale: 4096.0,
            backoff_factor: 3.0,
            ..LossScaleConfig::default()
        });
        assert_eq!(scaler.current_scale(), 4096.0);
        assert_eq!(scaler.config().backoff_factor, 0.5);
    }

    #[test]
    fn test_sanitize_replaces_non_finite_settings() {
        let defaults = LossScaleConfig::default();
        let scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: f32::NAN,
            growth_factor: f32::NAN,
            max_scale: f32::NAN,
            ..LossScaleConfig::default()
        });
        assert_eq!(scaler.config().max_scale, defaults.max_scale);
        assert_eq!(scaler.config().growth_factor, defaults.growth_factor);
        assert_eq!(scaler.current_scale(), defaults.init_scale);

        let unbounded = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 64.0,
            growth_interval: 1,
            max_scale: f32::INFINITY,
            ..LossScaleConfig::default()
        });
        assert_eq!(unbounded.config().max_scale, defaults.max_scale);
        assert_eq!(unbounded.current_scale(), 64.0);
    }

    #[test]
    fn test_nan_growth_factor_does_not_pin_scale_to_max() {
        let mut scaler = DynamicLossScaler::new(LossScaleConfig {
            init_scale: 16.0,
            growth_factor: f32::NAN,
            growth_interval: 1,
            ..LossScaleConfig::default()
        });
        let mut opt = CountingOptimizer::default();
        let mut params = Parameters::new();
        scaler.step(&mut opt, &mut params, grads(1.0)).unwrap();
        scaler.update();
        assert_eq!(scaler.current_scale(), 32.0);
    }
}
