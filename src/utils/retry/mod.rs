//! Retry utilities: exponential backoff with cap and jitter.
//!
//! Two consumers share one policy type:
//! - the optimistic state writer (`store::OptimisticWriter`) retries CAS
//!   conflicts in place through `backon`;
//! - the event queue reschedules failed deliveries, computing each
//!   `next_retry_at` from [`BackoffPolicy::delay_for_attempt`].

use std::time::Duration;

use backon::ExponentialBuilder;
use rand::Rng;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry (before jitter).
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Jitter factor: delay is multiplied by a random value in [1-jitter, 1+jitter].
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::for_state_writes()
    }
}

impl BackoffPolicy {
    /// CAS conflict retries: base 50ms, factor 2, cap 1s, 3 retries, ±25% jitter.
    pub fn for_state_writes() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_retries: 3,
            jitter: 0.25,
        }
    }

    /// Shared counter rows (rate-limit windows, breaker state): base 1ms,
    /// factor 2, cap 25ms, jittered. Every caller of one subject contends
    /// on the same row, so the retry count is effectively unbounded and the
    /// caller's deadline is what ends the loop.
    pub fn for_counters() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(25),
            max_retries: 10_000,
            jitter: 0.5,
        }
    }

    /// Event redelivery: base 1s, factor 2, cap 60s, 2 retries (3 attempts).
    pub fn for_event_delivery() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 2,
            jitter: 0.25,
        }
    }

    /// Calculate the delay before retry number `attempt` (0-indexed).
    ///
    /// delay = base * factor^attempt, capped at max_delay, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponential_ms = base_ms * self.factor.powi(attempt.min(30) as i32);
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as f64);

        let jittered_ms = if self.jitter > 0.0 {
            let spread: f64 = rand::rng().random_range(-1.0..=1.0);
            capped_ms * (1.0 + spread * self.jitter)
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms.max(0.0) as u64)
    }

    /// Check if another retry should be made after `attempt` retries so far.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Express this policy as a `backon` builder for in-place retry loops.
    pub fn to_backon(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor as f32)
            .with_max_times(self.max_retries as usize);
        if self.jitter > 0.0 {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

#[cfg(test)]
mod tests;
