//! Per-stage contexts threaded through filters and handlers
//!
//! Every stage of the pipeline wraps its payload in a [`Context`]: the message
//! while it is being filtered, the [`Response`] or the [`DeliveryError`] once
//! the transport has been called. Filters and handlers communicate through the
//! context's decision and delay, and keep their own state in its
//! [`Attributes`].
//!
//! A context is owned by exactly one stage at a time. When a message is
//! retried its attributes are moved into the next message context, so state
//! such as a backoff attempt survives across the whole retry sequence.

use std::{any::Any, fmt, sync::Arc, time::Duration};

use ahash::AHashMap;
use herald_common::{Message, Response};

use crate::error::DeliveryError;

/// What to do with a message after filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageDecision {
    /// Send the message once the context's delay has elapsed
    #[default]
    Send,
    /// Drop the message and settle its handle as cancelled
    Cancel,
}

/// What to do with a response or failure after handling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResultDecision {
    /// Hand the response or failure to the caller
    #[default]
    Return,
    /// Send the same message again after the context's delay
    Retry,
    /// Send a rewritten message after the context's delay, e.g. one narrowed
    /// to the recipients that failed
    Resend(Arc<Message>),
}

impl ResultDecision {
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Retry | Self::Resend(_))
    }
}

/// Type-erased side channel for filters and handlers.
///
/// Keys are plain strings; by convention each component uses one fixed key
/// (for example its type name) so entries do not collide.
#[derive(Default)]
pub struct Attributes {
    entries: AHashMap<String, Box<dyn Any + Send>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing anything already there
    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Look up `key`, returning `None` when it is missing or holds another type
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)?.downcast_mut()
    }

    /// Remove `key` and return its value if it held a `T`.
    ///
    /// An entry of another type is removed as well.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        self.entries
            .remove(key)?
            .downcast()
            .ok()
            .map(|boxed| *boxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// A payload together with the decision the pipeline is building for it.
///
/// The payload is fixed at construction; only the decision, the delay and the
/// attributes change as the context moves through filters or handlers.
#[derive(Debug)]
pub struct Context<P, D> {
    payload: P,
    decision: D,
    delay: Duration,
    attributes: Attributes,
}

/// Context of a message waiting to be sent
pub type MessageContext = Context<Arc<Message>, MessageDecision>;

/// Context of a response received from the service
pub type ResponseContext = Context<Response, ResultDecision>;

/// Context of a failed delivery attempt
pub type FailureContext = Context<Arc<DeliveryError>, ResultDecision>;

impl<P, D: Default> Context<P, D> {
    /// Fresh context with the default decision, no delay and no attributes
    pub fn new(payload: P) -> Self {
        Self::with_attributes(payload, Attributes::default())
    }

    /// Context continuing a previous stage, inheriting its attributes
    pub fn with_attributes(payload: P, attributes: Attributes) -> Self {
        Self {
            payload,
            decision: D::default(),
            delay: Duration::ZERO,
            attributes,
        }
    }
}

impl<P, D> Context<P, D> {
    pub const fn payload(&self) -> &P {
        &self.payload
    }

    pub const fn decision(&self) -> &D {
        &self.decision
    }

    pub fn set_decision(&mut self, decision: D) {
        self.decision = decision;
    }

    /// For message contexts, how long to wait before sending. For result
    /// contexts, how long to wait before a retry is sent.
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    pub const fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// Raise the delay to at least `delay`; a larger existing delay is kept
    pub fn raise_delay(&mut self, delay: Duration) {
        self.delay = self.delay.max(delay);
    }

    pub fn put<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.attributes.insert(key, value);
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key)
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.attributes.get_mut(key)
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        self.attributes.remove(key)
    }

    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Split the context into its payload, decision, delay and attributes
    pub fn into_parts(self) -> (P, D, Duration, Attributes) {
        (self.payload, self.decision, self.delay, self.attributes)
    }
}

impl MessageContext {
    pub fn message(&self) -> &Arc<Message> {
        &self.payload
    }

    pub fn is_cancelled(&self) -> bool {
        self.decision == MessageDecision::Cancel
    }

    pub fn cancel(&mut self) {
        self.decision = MessageDecision::Cancel;
    }
}

impl<P> Context<P, ResultDecision> {
    /// Ask for the message to be sent again after `delay`
    pub fn retry(&mut self, delay: Duration) {
        self.decision = ResultDecision::Retry;
        self.raise_delay(delay);
    }
}
