//! The dispatch state machine
//!
//! Every pushed message moves through the same stages:
//!
//! 1. **Enqueue**: enqueue filters run on the caller's thread; a cancel settles
//!    the handle straight away, otherwise the message is scheduled
//! 2. **Dequeue**: after the scheduled delay the dequeue filters run; a raised
//!    delay reschedules the message, a cancel settles the handle
//! 3. **Issue**: the transport is called on the blocking pool, bounded by a
//!    semaphore
//! 4. **Resolve**: response or failure handlers decide whether the handle
//!    settles or the message (or a rewritten one) goes back to stage 2
//!
//! Each stage is a separate tokio task spawned by the previous one, so a
//! message only ever has one active stage. A panic anywhere in a stage is
//! caught at the task boundary and fails the handle with
//! [`SystemError::Defect`].

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::FutureExt;
use herald_common::{Message, Response, pipeline};
use tokio::{
    runtime::Handle,
    sync::{Notify, Semaphore},
};
use tracing::{debug, error, warn};

use crate::{
    context::{FailureContext, MessageContext, ResponseContext, ResultDecision},
    error::{AlreadySettled, DeliveryError, SystemError},
    handle::{ResponseHandle, SettledKind},
    handlers::Handlers,
    transport::Transport,
};

/// One in-flight message: its handle plus the context of its current stage
struct Job {
    id: u64,
    handle: ResponseHandle,
    context: MessageContext,
}

enum Outcome {
    Completed(Response),
    Failed(Arc<DeliveryError>),
    Cancelled,
}

struct Inner {
    transport: Arc<dyn Transport>,
    handlers: Arc<Handlers>,
    runtime: Handle,
    permits: Semaphore,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Pushes messages through the filter and handler chains to a [`Transport`].
///
/// Cloning a dispatcher is cheap; clones share the chains, the transport and
/// the in-flight accounting.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher running its stages on `runtime`.
    ///
    /// At most `max_concurrent_deliveries` transport calls run at once; zero
    /// is treated as one.
    pub fn new(
        transport: Arc<dyn Transport>,
        handlers: Arc<Handlers>,
        runtime: Handle,
        max_concurrent_deliveries: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                handlers,
                runtime,
                permits: Semaphore::new(max_concurrent_deliveries.max(1)),
                next_id: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// The chains this dispatcher runs. Appending to them takes effect for
    /// every stage that starts afterwards.
    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.inner.handlers
    }

    /// Submit a message for delivery.
    ///
    /// Never blocks on the network: the returned handle settles once the
    /// message has been delivered, has failed, or was cancelled.
    pub fn push(&self, message: impl Into<Arc<Message>>) -> ResponseHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ResponseHandle::new();
        let mut context = MessageContext::new(message.into());

        let filtered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.handlers.filter_enqueue(&mut context);
        }));

        if let Err(panic) = filtered {
            let reason = panic_message(&*panic);
            error!(message_id = id, %reason, "Enqueue filter panicked");
            let _ = handle.fail(Arc::new(SystemError::Defect(reason).into()));
            return handle;
        }

        if context.is_cancelled() {
            pipeline!(level = DEBUG, message_id = id, "Message cancelled by enqueue filter");
            let _ = handle.cancelled();
            return handle;
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        self.inner.schedule(Job {
            id,
            handle: handle.clone(),
            context,
        });

        handle
    }

    /// Number of pushed messages whose handle the dispatcher has not settled
    /// yet
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every in-flight message has settled, or `timeout` passes.
    ///
    /// Returns `true` if nothing is left in flight. A `timeout` too large to
    /// form a deadline waits without one.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            let idle = self.inner.idle.notified();

            let remaining = self.in_flight();
            if remaining == 0 {
                pipeline!("All in-flight messages settled");
                return true;
            }

            debug!(remaining, "Waiting for in-flight messages to settle");
            let Some(deadline) = deadline else {
                idle.await;
                continue;
            };

            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let remaining = self.in_flight();
                if remaining > 0 {
                    warn!(remaining, "Drain timeout exceeded, messages still in flight");
                }
                return remaining == 0;
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.inner.handlers)
            .field("in_flight", &self.in_flight())
            .field("available_permits", &self.inner.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Spawn the dequeue stage of `job` after its context's delay
    fn schedule(self: &Arc<Self>, job: Job) {
        let inner = Arc::clone(self);
        let delay = job.context.delay();
        let id = job.id;
        let handle = job.handle.clone();

        pipeline!(message_id = id, ?delay, "Scheduling message");

        self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    // Only the caller can settle the handle while we sleep
                    _ = handle.wait() => {}
                }
            }

            let stage = AssertUnwindSafe(Arc::clone(&inner).process(job));
            if let Err(panic) = stage.catch_unwind().await {
                let reason = panic_message(&*panic);
                error!(message_id = id, %reason, "Defect while processing message");
                inner.finish(
                    id,
                    &handle,
                    Outcome::Failed(Arc::new(SystemError::Defect(reason).into())),
                );
            }
        });
    }

    #[tracing::instrument(level = "trace", skip_all, fields(message_id = job.id))]
    async fn process(self: Arc<Self>, mut job: Job) {
        if job.handle.is_done() {
            debug!("Handle settled before dequeue, dropping message");
            self.release();
            return;
        }

        job.context.set_delay(Duration::ZERO);
        self.handlers.filter_dequeue(&mut job.context);

        if job.context.is_cancelled() {
            self.finish(job.id, &job.handle, Outcome::Cancelled);
        } else if !job.context.delay().is_zero() {
            self.schedule(job);
        } else {
            self.issue(job).await;
        }
    }

    #[tracing::instrument(level = "trace", skip_all, fields(message_id = job.id))]
    async fn issue(self: Arc<Self>, job: Job) {
        let Job {
            id,
            handle,
            context,
        } = job;
        let (message, _, _, attributes) = context.into_parts();

        let result = {
            let Ok(_permit) = self.permits.acquire().await else {
                self.finish(
                    id,
                    &handle,
                    Outcome::Failed(Arc::new(SystemError::ShuttingDown.into())),
                );
                return;
            };

            let transport = Arc::clone(&self.transport);
            let outbound = Arc::clone(&message);
            match tokio::task::spawn_blocking(move || transport.deliver(&outbound)).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(SystemError::ShuttingDown.into()),
            }
        };

        if handle.is_done() {
            debug!("Handle settled during delivery, discarding result");
            self.release();
            return;
        }

        match result {
            Ok(response) => {
                let mut context = ResponseContext::with_attributes(response, attributes);
                self.handlers.handle_response(&mut context);

                let (response, decision, delay, attributes) = context.into_parts();
                self.resolve(
                    Job {
                        id,
                        handle,
                        context: MessageContext::with_attributes(message, attributes),
                    },
                    decision,
                    delay,
                    Outcome::Completed(response),
                );
            }
            Err(error) => {
                let mut context = FailureContext::with_attributes(Arc::new(error), attributes);
                self.handlers.handle_failure(&mut context);

                let (error, decision, delay, attributes) = context.into_parts();
                self.resolve(
                    Job {
                        id,
                        handle,
                        context: MessageContext::with_attributes(message, attributes),
                    },
                    decision,
                    delay,
                    Outcome::Failed(error),
                );
            }
        }
    }

    /// Act on the decision of the response or failure handlers
    fn resolve(
        self: &Arc<Self>,
        mut job: Job,
        decision: ResultDecision,
        delay: Duration,
        outcome: Outcome,
    ) {
        match decision {
            ResultDecision::Return => self.finish(job.id, &job.handle, outcome),
            ResultDecision::Retry => {
                debug!(message_id = job.id, ?delay, "Retrying message");
                job.context.set_delay(delay);
                self.schedule(job);
            }
            ResultDecision::Resend(message) => {
                debug!(
                    message_id = job.id,
                    ?delay,
                    targets = message.registration_ids().len(),
                    "Resending rewritten message"
                );
                let (_, _, _, attributes) = job.context.into_parts();
                let mut context = MessageContext::with_attributes(message, attributes);
                context.set_delay(delay);
                self.schedule(Job {
                    id: job.id,
                    handle: job.handle,
                    context,
                });
            }
        }
    }

    /// Settle `handle` and retire the message
    fn finish(&self, id: u64, handle: &ResponseHandle, outcome: Outcome) {
        let settled = match outcome {
            Outcome::Completed(response) => handle.complete(response),
            Outcome::Failed(error) => handle.fail(error),
            Outcome::Cancelled => handle.cancelled(),
        };

        match settled {
            Ok(()) => pipeline!(message_id = id, "Message settled"),
            Err(AlreadySettled {
                previous: SettledKind::Cancelled,
            }) => debug!(message_id = id, "Message was cancelled by the caller"),
            Err(e) => error!(message_id = id, error = %e, "Attempted to settle a handle twice"),
        }

        self.release();
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
