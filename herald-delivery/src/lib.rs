//! Asynchronous dispatch pipeline for the herald push dispatcher
//!
//! A [`Dispatcher`] accepts messages, runs them through ordered chains of
//! filters and handlers, and delivers them with a [`Transport`]. Callers get a
//! [`ResponseHandle`] that settles exactly once.
//!
//! The standard chain, assembled by [`DispatcherConfig::build`], is:
//! - [`GlobalBackoffThrottle`]: paces all messages from `Retry-After` signals
//!   and per-message exponential backoff, and narrows partial failures to the
//!   retryable targets
//! - [`RateLimiter`]: optional token bucket per collapse key
//! - [`RetryBudget`]: retries temporary failures and caps retries per message

pub mod backoff;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod handlers;
pub mod rate_limiter;
pub mod retry;
pub mod throttle;
pub mod transport;

pub use backoff::{Attempt, Backoff, BackoffConfig, ExponentialBackoff};
pub use config::{DispatcherConfig, find_config_file};
pub use context::{
    Attributes, Context, FailureContext, MessageContext, MessageDecision, ResponseContext,
    ResultDecision,
};
pub use dispatcher::Dispatcher;
pub use error::{
    AlreadySettled, DeliveryError, HandleError, PermanentError, SystemError, TemporaryError,
};
pub use handle::{ResponseHandle, SettledKind};
pub use handlers::{FailureHandler, Handlers, MessageFilter, ResponseHandler, Stage};
pub use rate_limiter::{KeyRateLimit, RateLimitConfig, RateLimiter};
pub use retry::{RetryBudget, RetryPolicy};
pub use throttle::GlobalBackoffThrottle;
pub use transport::{Exchange, JsonTransport, RawReply, Transport};
