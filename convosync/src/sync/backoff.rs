//! Reconnect delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// The nominal delay doubles per attempt from `base` up to `max`; the
/// actual delay is drawn uniformly from `[nominal / 2, nominal]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff. A `max` below `base` is raised to `base`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Nominal delay for the current attempt, before jitter.
    #[must_use]
    pub fn nominal(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Returns the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal();
        self.attempt = self.attempt.saturating_add(1);
        let high = u64::try_from(nominal.as_millis()).unwrap_or(u64::MAX);
        if high == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(high / 2..=high))
    }

    /// Starts over after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}
