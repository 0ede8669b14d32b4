//! Rolling-average stopwatch used for per-iteration timing.

use std::time::{Duration, Instant};

/// Stopwatch accumulating elapsed time over repeated tic/toc cycles.
///
/// Totals are never reset implicitly: a timer created at the start of a run
/// reports whole-run rolling averages, not per-epoch ones.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    accumulated: Duration,
    count: u64,
    started_at: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the stopwatch. Calls do not stack.
    pub fn tic(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop the stopwatch, fold the elapsed time into the running totals and
    /// return it. A `toc` without a preceding `tic` records nothing.
    pub fn toc(&mut self) -> Duration {
        let Some(start) = self.started_at.take() else {
            return Duration::ZERO;
        };
        let elapsed = start.elapsed();
        self.accumulated += elapsed;
        self.count += 1;
        elapsed
    }

    pub fn accumulated_time(&self) -> f64 {
        self.accumulated.as_secs_f64()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean seconds per completed cycle, `0.0` before the first `toc`.
    pub fn average_time(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.accumulated.as_secs_f64() / self.count as f64
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }
}

/// The three timers the scheduler toggles each iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationTimers {
    /// Whole iteration, stopped and immediately restarted at iteration end.
    pub total: Timer,
    /// Time spent waiting on the data supply for the next batch.
    pub read: Timer,
    /// Forward, backward and optimizer step.
    pub compute: Timer,
}

impl IterationTimers {
    /// Estimated wall-clock hours for one epoch of `iterations_per_epoch`.
    pub fn hours_per_epoch(&self, iterations_per_epoch: usize) -> f64 {
        self.total.average_time() / 3600.0 * iterations_per_epoch as f64
    }
}
