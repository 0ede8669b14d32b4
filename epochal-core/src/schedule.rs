//! Learning-rate schedules, evaluated once at the start of every epoch.

use serde::{Deserialize, Serialize};

/// Produces the learning rate for an epoch.
pub trait LrSchedule: Send {
    fn lr_at(&self, epoch: usize) -> f64;
}

/// Same rate for every epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constant(pub f64);

impl LrSchedule for Constant {
    fn lr_at(&self, _epoch: usize) -> f64 {
        self.0
    }
}

/// Piecewise-constant decay: `base_lr * factor^k`, where `k` is the number of
/// decay epochs already reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDecay {
    pub base_lr: f64,
    pub decay_epochs: Vec<usize>,
    pub factor: f64,
}

impl LrSchedule for StepDecay {
    fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.decay_epochs.iter().filter(|e| **e <= epoch).count();
        self.base_lr * self.factor.powi(passed as i32)
    }
}

impl<F> LrSchedule for F
where
    F: Fn(usize) -> f64 + Send,
{
    fn lr_at(&self, epoch: usize) -> f64 {
        self(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_decay() {
        let sched = StepDecay {
            base_lr: 1e-3,
            decay_epochs: vec![10, 12],
            factor: 0.1,
        };
        assert_eq!(sched.lr_at(0), 1e-3);
        assert_eq!(sched.lr_at(9), 1e-3);
        assert!((sched.lr_at(10) - 1e-4).abs() < 1e-12);
        assert!((sched.lr_at(13) - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn test_closure_schedule() {
        let warmup = |epoch: usize| 0.1 * (epoch as f64 + 1.0).min(5.0);
        assert_eq!(warmup.lr_at(0), 0.1);
        assert_eq!(Constant(0.5).lr_at(100), 0.5);
    }
}
