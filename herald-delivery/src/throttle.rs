//! Global backoff shared by every message
//!
//! [`GlobalBackoffThrottle`] paces the whole dispatcher from service-level
//! signals. It keeps two pieces of state:
//!
//! - a per-message [`Attempt`], stored in the context attributes so it
//!   follows the message through its retries
//! - a process-wide "not before" timestamp taken from the last `Retry-After`
//!   the service sent, which delays every message, not just the one that saw it
//!
//! A message is held back for whichever of the two is longer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use herald_common::ServerResponse;
use tracing::debug;

use crate::{
    backoff::{Attempt, Backoff},
    context::{Context, MessageContext, ResponseContext, ResultDecision},
    handlers::{Handlers, MessageFilter, ResponseHandler, Stage},
};

/// Attribute key holding the throttle's [`Attempt`]
pub const ATTEMPT_KEY: &str = "herald.throttle.attempt";

type BoxedAttempt = Box<dyn Attempt>;

pub struct GlobalBackoffThrottle {
    backoff: Arc<dyn Backoff>,
    /// Unix milliseconds before which nothing should be sent, 0 when unset
    not_before_ms: AtomicU64,
}

impl GlobalBackoffThrottle {
    pub fn new(backoff: Arc<dyn Backoff>) -> Self {
        Self {
            backoff,
            not_before_ms: AtomicU64::new(0),
        }
    }

    /// Install the throttle as enqueue filter, dequeue filter and response
    /// handler of `handlers`.
    pub fn register(self: &Arc<Self>, handlers: &Handlers) {
        handlers.append_enqueue_filter(Arc::clone(self) as Arc<dyn MessageFilter>);
        handlers.append_dequeue_filter(Arc::clone(self) as Arc<dyn MessageFilter>);
        handlers.append_response_handler(Arc::clone(self) as Arc<dyn ResponseHandler>);
    }

    /// The shared retry-after floor, if one is set
    pub fn not_before(&self) -> Option<SystemTime> {
        match self.not_before_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Time left until the shared retry-after floor passes
    pub fn floor(&self) -> Duration {
        match self.not_before_ms.load(Ordering::Acquire) {
            0 => Duration::ZERO,
            ms => Duration::from_millis(ms.saturating_sub(unix_millis(SystemTime::now()))),
        }
    }

    fn record_retry_after(&self, retry_after: SystemTime) {
        // Last writer wins
        self.not_before_ms
            .store(unix_millis(retry_after).max(1), Ordering::Release);
    }

    /// Run `f` on the context's attempt, starting one if there is none yet
    fn with_attempt<P, D, R>(
        &self,
        context: &mut Context<P, D>,
        f: impl FnOnce(&mut dyn Attempt) -> R,
    ) -> R {
        let mut attempt = context
            .remove::<BoxedAttempt>(ATTEMPT_KEY)
            .unwrap_or_else(|| self.backoff.begin());
        let result = f(attempt.as_mut());
        context.put(ATTEMPT_KEY, attempt);
        result
    }

    /// `max(attempt delay, retry-after floor)` for `context`
    fn delay_for<P, D>(&self, context: &mut Context<P, D>) -> Duration {
        let attempt_delay = self.with_attempt(context, |attempt| attempt.delay());
        attempt_delay.max(self.floor())
    }
}

impl MessageFilter for GlobalBackoffThrottle {
    fn filter(&self, stage: Stage, context: &mut MessageContext) {
        if context.is_cancelled() {
            return;
        }

        let delay = self.delay_for(context);
        if !delay.is_zero() {
            debug!(
                ?stage,
                ?delay,
                collapse_key = context.message().collapse_key(),
                "Throttling message"
            );
        }
        context.raise_delay(delay);
    }
}

impl ResponseHandler for GlobalBackoffThrottle {
    fn supports(&self, context: &ResponseContext) -> bool {
        matches!(
            context.payload().server_response(),
            ServerResponse::Success | ServerResponse::ServiceUnavailable
        )
    }

    fn handle(&self, context: &mut ResponseContext) {
        match context.payload().server_response() {
            ServerResponse::ServiceUnavailable => {
                self.with_attempt(context, |attempt| attempt.record_failure());
                if let Some(retry_after) = context.payload().retry_after() {
                    self.record_retry_after(retry_after);
                }

                let delay = self.delay_for(context);
                debug!(?delay, "Service unavailable, retrying message");
                context.retry(delay);
            }
            ServerResponse::Success => {
                let response = context.payload();
                let narrowed = response
                    .result()
                    .filter(|result| result.failure > 0)
                    .and_then(|result| {
                        response
                            .message()
                            .retarget(result.retryable_targets(response.message()))
                    });

                let Some(narrowed) = narrowed else {
                    self.with_attempt(context, |attempt| attempt.record_success());
                    return;
                };

                self.with_attempt(context, |attempt| attempt.record_failure());
                let delay = self.delay_for(context);
                debug!(
                    targets = narrowed.registration_ids().len(),
                    ?delay,
                    "Partial failure, resending to retryable targets"
                );
                context.set_decision(ResultDecision::Resend(Arc::new(narrowed)));
                context.raise_delay(delay);
            }
            ServerResponse::Unauthorized | ServerResponse::InternalError => {}
        }
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
