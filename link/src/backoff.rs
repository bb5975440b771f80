//! Retry delay computation
//!
//! Exponential backoff with a per-driver cap and optional jitter. The
//! reference deployments disagree on the cap (30s for controller and tunnel
//! reconnection, 60s for the broker), so the cap is a parameter everywhere
//! and nothing in this crate treats either value as special.

use std::time::Duration;

/// Default base delay for the first retry.
///
/// The first retry after a detected disconnect must begin within a small
/// bounded time, which rules out starting at the cap.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Computes retry delays from the attempt count.
///
/// `next_delay(attempt)` is a pure function: exponential from the base,
/// monotonically non-decreasing, capped. The policy also tracks the current
/// attempt count for the owning supervisor; [`BackoffPolicy::reset`] zeroes
/// it the instant a connect succeeds.
///
/// Jitter defaults to off. When enabled (factor in `(0.0, 1.0]`) the delay
/// varies by up to +/- half the factor around the exponential value, never
/// below 100ms and never above the cap.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_factor: 0.0,
            attempt: 0,
        }
    }

    /// Enable jitter to prevent thundering-herd reconnects across many
    /// supervisors pointed at the same endpoint. Factor is clamped to [0, 1].
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// The configured delay cap.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Number of consecutive failed attempts since the last success.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for a given 0-based attempt number: `base * 2^attempt`, capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt.min(31)))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter_factor > 0.0 {
            let jitter_range = exponential.as_secs_f64() * self.jitter_factor;
            let random_offset = rand::random::<f64>() * jitter_range - (jitter_range / 2.0);
            let jittered = (exponential.as_secs_f64() + random_offset).max(0.1);
            Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
        } else {
            exponential
        }
    }

    /// Record a failed attempt and return the delay to sleep before the
    /// next one. The first call after a reset returns `next_delay(0)`.
    pub fn advance(&mut self) -> Duration {
        let delay = self.next_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Zero the attempt count. Called the instant a connect succeeds.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
