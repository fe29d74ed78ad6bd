//! Exponential backoff with jitter.
//!
//! Shared by pooled connection reconnects, stream reconnects and the
//! event-stream transport.

use rand::Rng;
use std::time::Duration;

use crate::config::schema::ReconnectConfig;

/// Upper bound of the jitter widening, as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.3;

/// Reconnect delay schedule: `min(initial × multiplier^attempt, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before `attempt` (zero-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Delay before `attempt`, widened by up to 30% when jitter is enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        base + base.mul_f64(factor)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once `attempts` failed attempts have used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
