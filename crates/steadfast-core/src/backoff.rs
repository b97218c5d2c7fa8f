//! Backoff delay formulas.
//!
//! `n` is the per-category attempt index (0 for the first retry of that
//! category). Every strategy is capped at the supplied maximum.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay before a retried attempt grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base`
    Fixed,
    /// `(n + 1) * base`, so the first retry already waits `base`
    Linear,
    /// `2^n * base`
    Exponential,
    /// Uniform in `[0, 2^n * base]`
    #[default]
    FullJitter,
    /// Uniform in `[base / 2, base * 1.5]`
    FixedJitter,
}

impl BackoffStrategy {
    /// Compute the delay for retry `n`, drawing jitter from the thread RNG.
    pub fn delay(self, n: u32, base: Duration, max: Duration) -> Duration {
        self.delay_with_sample(n, base, max, rand::random::<f64>())
    }

    /// Compute the delay for retry `n` with an explicit jitter sample in `[0, 1)`.
    ///
    /// Deterministic strategies ignore the sample.
    pub fn delay_with_sample(self, n: u32, base: Duration, max: Duration, sample: f64) -> Duration {
        let base_ms = base.as_millis() as f64;
        let sample = sample.clamp(0.0, 1.0);

        let ms = match self {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * (f64::from(n) + 1.0),
            BackoffStrategy::Exponential => base_ms * exponent(n),
            BackoffStrategy::FullJitter => sample * base_ms * exponent(n),
            BackoffStrategy::FixedJitter => base_ms * (0.5 + sample),
        };

        let capped = ms.min(max.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// `2^n`, saturating well before f64 loses integer precision.
fn exponent(n: u32) -> f64 {
    2f64.powi(n.min(30) as i32)
}
