//! Retry timing
//!
//! A [`Backoff`] hands out one [`Attempt`] per retry sequence. The attempt is
//! told about every success and failure, and reports how long the next send
//! should still wait. The wait is measured from the last failure, so asking
//! again later yields a smaller value and eventually zero.

use std::{
    fmt,
    time::{Duration, Instant},
};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Starts tracking retry sequences.
pub trait Backoff: Send + Sync {
    fn begin(&self) -> Box<dyn Attempt>;
}

/// Timing state of one message's retry sequence.
pub trait Attempt: Send {
    /// Remaining wait before the next send, zero if it may go now
    fn delay(&self) -> Duration;

    fn record_success(&mut self);

    fn record_failure(&mut self);
}

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Wait after the first failure.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the wait, before jitter.
    ///
    /// Default: 60000 ms
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// The wait is randomised within ±`jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

mod defaults {
    pub const fn base_delay_ms() -> u64 {
        1_000
    }

    pub const fn max_delay_ms() -> u64 {
        60_000
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }
}

/// Calculate the wait before retry number `attempt` (1-indexed)
///
/// # Formula
/// `delay = min(base * 2^(attempt - 1), max) * (1 ± jitter)`
pub fn exponential_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = attempt - 1;
    let delay = if exponent >= 63 {
        max_delay_ms
    } else {
        base_delay_ms.saturating_mul(1u64 << exponent).min(max_delay_ms)
    };

    if jitter_factor <= 0.0 || delay == 0 {
        return Duration::from_millis(delay);
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = {
        let jitter_range = (delay as f64) * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        ((delay as f64) + jitter).max(0.0) as u64
    };

    Duration::from_millis(jittered)
}

/// [`Backoff`] doubling the wait after each consecutive failure
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Backoff for ExponentialBackoff {
    fn begin(&self) -> Box<dyn Attempt> {
        Box::new(ExponentialAttempt {
            config: self.config.clone(),
            failures: 0,
            eligible_at: None,
        })
    }
}

struct ExponentialAttempt {
    config: BackoffConfig,
    failures: u32,
    eligible_at: Option<Instant>,
}

impl Attempt for ExponentialAttempt {
    fn delay(&self) -> Duration {
        self.eligible_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()))
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.eligible_at = None;
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        let wait = exponential_delay(
            self.failures,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            self.config.jitter_factor,
        );
        self.eligible_at = Some(Instant::now() + wait);
    }
}

impl fmt::Debug for ExponentialAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialAttempt")
            .field("failures", &self.failures)
            .field("delay", &self.delay())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::thread;

    use super::*;

    fn no_jitter(base_delay_ms: u64, max_delay_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(BackoffConfig {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_exponential_delay_calculation() {
        assert_eq!(exponential_delay(0, 100, 10_000, 0.0), Duration::ZERO);
        assert_eq!(exponential_delay(1, 100, 10_000, 0.0), Duration::from_millis(100));
        assert_eq!(exponential_delay(2, 100, 10_000, 0.0), Duration::from_millis(200));
        assert_eq!(exponential_delay(3, 100, 10_000, 0.0), Duration::from_millis(400));
        assert_eq!(exponential_delay(20, 100, 10_000, 0.0), Duration::from_millis(10_000));
        assert_eq!(exponential_delay(200, 100, 10_000, 0.0), Duration::from_millis(10_000));
    }

    #[test]
    fn test_exponential_delay_with_jitter() {
        for _ in 0..50 {
            let delay = exponential_delay(2, 1_000, 60_000, 0.2);
            assert!(
                delay >= Duration::from_millis(1_600) && delay <= Duration::from_millis(2_400),
                "{delay:?} outside ±20% of 2000ms"
            );
        }
    }

    #[test]
    fn test_fresh_attempt_has_no_delay() {
        let attempt = no_jitter(100, 1_000).begin();
        assert_eq!(attempt.delay(), Duration::ZERO);
    }

    #[test]
    fn test_failures_grow_delay_and_success_resets() {
        let mut attempt = no_jitter(10_000, 60_000).begin();

        attempt.record_failure();
        let first = attempt.delay();
        assert!(first > Duration::from_millis(9_000) && first <= Duration::from_millis(10_000));

        attempt.record_failure();
        let second = attempt.delay();
        assert!(second > Duration::from_millis(19_000) && second <= Duration::from_millis(20_000));

        attempt.record_success();
        assert_eq!(attempt.delay(), Duration::ZERO);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Time-based test not compatible with Miri")]
    fn test_delay_decays_with_time() {
        let mut attempt = no_jitter(30, 1_000).begin();
        attempt.record_failure();
        assert!(attempt.delay() > Duration::ZERO);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(attempt.delay(), Duration::ZERO);
    }

    #[test]
    fn test_config_defaults_from_ron() {
        let config: BackoffConfig = ron::from_str("(base_delay_ms: 250)").unwrap();
        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 60_000);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
    }
}
