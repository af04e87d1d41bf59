//! Retry policy for delivery operations.
//!
//! [`RetryPolicy`] holds the retry configuration; [`RetryBudget`] applies it
//! as a response and failure handler. Registered after every other handler,
//! the budget:
//!
//! - retries temporary transport failures nobody else decided on, with
//!   exponential backoff
//! - counts every retry in the context attributes
//! - turns a retry into a return once `max_attempts` is used up, so no message
//!   can retry forever

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    backoff::exponential_delay,
    context::{Context, FailureContext, ResponseContext, ResultDecision},
    handlers::{FailureHandler, Handlers, ResponseHandler},
};

/// Attribute key holding the number of retries made so far
pub const RETRIES_KEY: &str = "herald.retry.count";

/// Retry policy configuration for delivery operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts before giving up.
    ///
    /// Default: 5 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The actual delay is calculated as: `base * 2^(attempts - 1)`
    ///
    /// Default: 500 ms
    #[serde(default = "defaults::base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Maximum retry delay (in milliseconds).
    ///
    /// Default: 30000 ms
    #[serde(default = "defaults::max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Jitter factor for randomizing retry delays, within ±`retry_jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_ms: defaults::base_retry_delay_ms(),
            max_retry_delay_ms: defaults::max_retry_delay_ms(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another attempt is allowed after `attempt_count` attempts
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Attempts left after `attempt_count`, saturating at zero
    #[must_use]
    pub const fn remaining_attempts(&self, attempt_count: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt_count)
    }

    /// Wait before the next attempt, given the number of attempts made so far
    #[must_use]
    pub fn retry_delay(&self, attempt_count: u32) -> Duration {
        exponential_delay(
            attempt_count.max(1),
            self.base_retry_delay_ms,
            self.max_retry_delay_ms,
            self.retry_jitter_factor,
        )
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        5
    }

    pub const fn base_retry_delay_ms() -> u64 {
        500
    }

    pub const fn max_retry_delay_ms() -> u64 {
        30_000
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}

/// Handler enforcing a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    policy: RetryPolicy,
}

impl RetryBudget {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Install the budget as response and failure handler of `handlers`
    pub fn register(self: &Arc<Self>, handlers: &Handlers) {
        handlers.append_response_handler(Arc::clone(self) as Arc<dyn ResponseHandler>);
        handlers.append_failure_handler(Arc::clone(self) as Arc<dyn FailureHandler>);
    }

    /// Attempts made so far: the first send plus every retry
    fn attempts<P>(context: &Context<P, ResultDecision>) -> u32 {
        context.get::<u32>(RETRIES_KEY).copied().unwrap_or(0) + 1
    }

    /// Count the pending retry, or veto it once the budget is spent
    fn enforce<P>(&self, context: &mut Context<P, ResultDecision>) {
        if !context.decision().is_retry() {
            return;
        }

        let attempts = Self::attempts(context);
        if self.policy.should_retry(attempts) {
            context.put(RETRIES_KEY, attempts);
            debug!(
                attempt = attempts,
                remaining = self.policy.remaining_attempts(attempts),
                "Retry within budget"
            );
        } else {
            warn!(
                attempts,
                max_attempts = self.policy.max_attempts,
                "Retry budget exhausted, returning last result"
            );
            context.set_decision(ResultDecision::Return);
        }
    }
}

impl ResponseHandler for RetryBudget {
    fn handle(&self, context: &mut ResponseContext) {
        self.enforce(context);
    }
}

impl FailureHandler for RetryBudget {
    fn handle(&self, context: &mut FailureContext) {
        if context.payload().is_temporary() && *context.decision() == ResultDecision::Return {
            let delay = self.policy.retry_delay(Self::attempts(context));
            debug!(error = %context.payload(), ?delay, "Temporary failure, retrying");
            context.retry(delay);
        }

        self.enforce(context);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::{Message, Response};

    use super::*;
    use crate::error::{DeliveryError, PermanentError, TemporaryError};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 1_000,
            retry_jitter_factor: 0.0,
        }
    }

    fn message() -> Arc<Message> {
        Arc::new(
            Message::builder()
                .registration_id("device")
                .collapse_key("k")
                .build()
                .unwrap(),
        )
    }

    fn temporary() -> FailureContext {
        Context::new(Arc::new(DeliveryError::Temporary(
            TemporaryError::ConnectionClosed,
        )))
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_retry_delay_ms, 500);
        assert_eq!(policy.max_retry_delay_ms, 30_000);
        assert!((policy.retry_jitter_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_retry() {
        let policy = policy(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));

        assert_eq!(policy.remaining_attempts(1), 2);
        assert_eq!(policy.remaining_attempts(5), 0);
    }

    #[test]
    fn test_retry_delay_grows() {
        let policy = policy(10);
        assert_eq!(policy.retry_delay(1), Duration::from_millis(100));
        assert_eq!(policy.retry_delay(2), Duration::from_millis(200));
        assert_eq!(policy.retry_delay(3), Duration::from_millis(400));
        assert_eq!(policy.retry_delay(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_temporary_failure_is_retried() {
        let budget = RetryBudget::new(policy(3));
        let mut ctx = temporary();

        FailureHandler::handle(&budget, &mut ctx);

        assert_eq!(*ctx.decision(), ResultDecision::Retry);
        assert_eq!(ctx.delay(), Duration::from_millis(100));
        assert_eq!(ctx.get::<u32>(RETRIES_KEY), Some(&1));
    }

    #[test]
    fn test_permanent_failure_is_returned() {
        let budget = RetryBudget::new(policy(3));
        let mut ctx: FailureContext = Context::new(Arc::new(DeliveryError::Permanent(
            PermanentError::InvalidRequest("missing collapse_key".to_string()),
        )));

        FailureHandler::handle(&budget, &mut ctx);

        assert_eq!(*ctx.decision(), ResultDecision::Return);
        assert!(ctx.get::<u32>(RETRIES_KEY).is_none());
    }

    #[test]
    fn test_budget_exhaustion_forces_return() {
        let budget = RetryBudget::new(policy(3));
        let mut ctx = temporary();
        ctx.put(RETRIES_KEY, 2_u32);

        FailureHandler::handle(&budget, &mut ctx);

        assert_eq!(*ctx.decision(), ResultDecision::Return);
    }

    #[test]
    fn test_response_retry_counts_against_budget() {
        let budget = RetryBudget::new(policy(2));

        let mut ctx: ResponseContext = Context::new(Response::unavailable(None, message()));
        ctx.set_decision(ResultDecision::Retry);
        ResponseHandler::handle(&budget, &mut ctx);
        assert_eq!(*ctx.decision(), ResultDecision::Retry);
        assert_eq!(ctx.get::<u32>(RETRIES_KEY), Some(&1));

        let (response, _, _, attributes) = ctx.into_parts();
        let mut ctx: ResponseContext = Context::with_attributes(response, attributes);
        ctx.set_decision(ResultDecision::Retry);
        ResponseHandler::handle(&budget, &mut ctx);
        assert_eq!(*ctx.decision(), ResultDecision::Return);
    }

    #[test]
    fn test_response_return_is_left_alone() {
        let budget = RetryBudget::new(policy(1));
        let mut ctx: ResponseContext = Context::new(Response::unavailable(None, message()));

        ResponseHandler::handle(&budget, &mut ctx);

        assert_eq!(*ctx.decision(), ResultDecision::Return);
        assert!(ctx.attributes().is_empty());
    }
}
