//! Retry-rate statistic and the batch-size control law.

use super::policy::BatchPolicy;

/// Smoothed rates below this are treated as zero, so a decaying EWMA can
/// reach the bottom of a `min = 0` band.
const RATE_FLOOR: f64 = 1e-4;

/// Running ratio of retried to dispatched operations for one group.
#[derive(Debug, Clone, Default)]
pub struct RetryRateWindow {
    dispatched_total: u64,
    retried_total: u64,
    smoothed: f64,
    samples: u64,
}

impl RetryRateWindow {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one batch outcome and returns the updated rate.
    ///
    /// `alpha` weighs the newest batch: `1.0` keeps only the latest ratio.
    /// An outcome with nothing dispatched leaves the rate unchanged.
    pub fn record(&mut self, dispatched: usize, retried: usize, alpha: f64) -> f64 {
        if dispatched == 0 {
            return self.smoothed;
        }
        let retried = retried.min(dispatched);
        self.dispatched_total += dispatched as u64;
        self.retried_total += retried as u64;

        let sample = retried as f64 / dispatched as f64;
        self.smoothed = if self.samples == 0 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * self.smoothed
        };
        if self.smoothed < RATE_FLOOR {
            self.smoothed = 0.0;
        }
        self.samples += 1;
        self.smoothed
    }

    /// Current smoothed rate in `[0, 1]`.
    pub fn rate(&self) -> f64 {
        self.smoothed
    }

    /// Operations dispatched since the window was created.
    pub fn dispatched_total(&self) -> u64 {
        self.dispatched_total
    }

    /// Operations retried since the window was created.
    pub fn retried_total(&self) -> u64 {
        self.retried_total
    }

    /// Outcomes recorded.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Next batch-size cap for a group given the current retry `rate`.
///
/// Above the band the cap shrinks multiplicatively, always by at least one and
/// never below one. At or below the band it grows by `increase_step` up to
/// `max_operations_per_batch`. Inside the band it holds.
pub fn next_cap(cap: usize, rate: f64, policy: &BatchPolicy) -> usize {
    let max = policy.max_operations_per_batch.max(1);
    let cap = cap.clamp(1, max);
    let band = policy.retry_rate_band;

    if rate > band.max {
        let scaled = (cap as f64 * policy.decrease_factor).floor() as usize;
        scaled.min(cap - 1).max(1)
    } else if rate <= band.min {
        cap.saturating_add(policy.increase_step).min(max)
    } else {
        cap
    }
}
