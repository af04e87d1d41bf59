//! Ordered filter and handler chains
//!
//! [`Handlers`] keeps four independent chains:
//!
//! 1. **Enqueue filters**: run once when a message is pushed
//! 2. **Dequeue filters**: run every time a scheduled message wakes up
//! 3. **Response handlers**: run for every response from the service
//! 4. **Failure handlers**: run for every error returned by the transport
//!
//! Every member of a chain runs, in registration order. A filter that cancels
//! a message does not stop the filters after it; the decision is only read once
//! the whole chain has run. Handlers are gated by their `supports` method.
//!
//! Chains are copy-on-write: registering takes a write lock and replaces the
//! list, while running a chain only clones the current snapshot. Registration
//! is therefore safe at any time, and a chain already running is unaffected by
//! it.

use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::context::{FailureContext, MessageContext, ResponseContext};

/// Where in the pipeline a filter is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The message was just pushed and is about to be scheduled
    Enqueue,
    /// The scheduled delay has elapsed and the message is about to be sent
    Dequeue,
}

/// Inspects, delays or cancels messages.
pub trait MessageFilter: Send + Sync {
    fn filter(&self, stage: Stage, context: &mut MessageContext);
}

impl<F> MessageFilter for F
where
    F: Fn(Stage, &mut MessageContext) + Send + Sync,
{
    fn filter(&self, stage: Stage, context: &mut MessageContext) {
        self(stage, context);
    }
}

/// Decides what happens to a response from the service.
pub trait ResponseHandler: Send + Sync {
    /// Whether this handler wants to see `context`. Unsupported responses
    /// never reach [`handle`](Self::handle).
    fn supports(&self, _context: &ResponseContext) -> bool {
        true
    }

    fn handle(&self, context: &mut ResponseContext);
}

impl<F> ResponseHandler for F
where
    F: Fn(&mut ResponseContext) + Send + Sync,
{
    fn handle(&self, context: &mut ResponseContext) {
        self(context);
    }
}

/// Decides what happens to an error returned by the transport.
pub trait FailureHandler: Send + Sync {
    fn supports(&self, _context: &FailureContext) -> bool {
        true
    }

    fn handle(&self, context: &mut FailureContext);
}

impl<F> FailureHandler for F
where
    F: Fn(&mut FailureContext) + Send + Sync,
{
    fn handle(&self, context: &mut FailureContext) {
        self(context);
    }
}

/// Append-only list with snapshot iteration
struct Chain<T: ?Sized> {
    members: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> Default for Chain<T> {
    fn default() -> Self {
        Self {
            members: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<T: ?Sized> Chain<T> {
    fn append(&self, member: Arc<T>) {
        let mut members = self.members.write();
        let mut next = Vec::with_capacity(members.len() + 1);
        next.extend(members.iter().cloned());
        next.push(member);
        *members = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        Arc::clone(&self.members.read())
    }

    fn len(&self) -> usize {
        self.members.read().len()
    }
}

/// Registry of the filter and handler chains used by a
/// [`Dispatcher`](crate::Dispatcher).
#[derive(Default)]
pub struct Handlers {
    enqueue_filters: Chain<dyn MessageFilter>,
    dequeue_filters: Chain<dyn MessageFilter>,
    response_handlers: Chain<dyn ResponseHandler>,
    failure_handlers: Chain<dyn FailureHandler>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_enqueue_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.enqueue_filters.append(filter);
    }

    pub fn append_dequeue_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.dequeue_filters.append(filter);
    }

    pub fn append_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.response_handlers.append(handler);
    }

    pub fn append_failure_handler(&self, handler: Arc<dyn FailureHandler>) {
        self.failure_handlers.append(handler);
    }

    /// Run every enqueue filter, in order
    pub fn filter_enqueue(&self, context: &mut MessageContext) {
        for filter in self.enqueue_filters.snapshot().iter() {
            filter.filter(Stage::Enqueue, context);
        }
    }

    /// Run every dequeue filter, in order
    pub fn filter_dequeue(&self, context: &mut MessageContext) {
        for filter in self.dequeue_filters.snapshot().iter() {
            filter.filter(Stage::Dequeue, context);
        }
    }

    /// Run every response handler that supports the response, in order
    pub fn handle_response(&self, context: &mut ResponseContext) {
        for handler in self.response_handlers.snapshot().iter() {
            if handler.supports(context) {
                handler.handle(context);
            }
        }
    }

    /// Run every failure handler that supports the failure, in order
    pub fn handle_failure(&self, context: &mut FailureContext) {
        for handler in self.failure_handlers.snapshot().iter() {
            if handler.supports(context) {
                handler.handle(context);
            }
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("enqueue_filters", &self.enqueue_filters.len())
            .field("dequeue_filters", &self.dequeue_filters.len())
            .field("response_handlers", &self.response_handlers.len())
            .field("failure_handlers", &self.failure_handlers.len())
            .finish()
    }
}
