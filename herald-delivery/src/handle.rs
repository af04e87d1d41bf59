//! Caller-side handle to a pushed message
//!
//! A [`ResponseHandle`] settles exactly once: to a response, to a failure, or
//! to cancellation. The dispatcher is the only writer; callers can wait
//! asynchronously, block with or without a timeout, poll, or cancel.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use herald_common::Response;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{AlreadySettled, DeliveryError, HandleError};

/// The terminal state a handle settled to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledKind {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for SettledKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug)]
enum State {
    Pending,
    Completed(Response),
    Failed(Arc<DeliveryError>),
    Cancelled,
}

impl State {
    const fn kind(&self) -> Option<SettledKind> {
        match self {
            Self::Pending => None,
            Self::Completed(_) => Some(SettledKind::Completed),
            Self::Failed(_) => Some(SettledKind::Failed),
            Self::Cancelled => Some(SettledKind::Cancelled),
        }
    }

    fn outcome(&self) -> Option<Result<Response, HandleError>> {
        match self {
            Self::Pending => None,
            Self::Completed(response) => Some(Ok(response.clone())),
            Self::Failed(error) => Some(Err(HandleError::Failed(Arc::clone(error)))),
            Self::Cancelled => Some(Err(HandleError::Cancelled)),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    settled: Condvar,
    notify: Notify,
}

/// Eventual result of a pushed message.
///
/// Cloning the handle yields another view of the same result.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    shared: Arc<Shared>,
}

impl ResponseHandle {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                settled: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Wait for the handle to settle.
    ///
    /// # Errors
    ///
    /// [`HandleError::Cancelled`] if the message was cancelled and
    /// [`HandleError::Failed`] if delivery failed.
    pub async fn wait(&self) -> Result<Response, HandleError> {
        loop {
            // Registered before the state check so a settle in between is not missed
            let notified = self.shared.notify.notified();

            if let Some(outcome) = self.try_get() {
                return outcome;
            }

            notified.await;
        }
    }

    /// Block the current thread until the handle settles.
    ///
    /// Must not be called from within an async task.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_blocking(&self) -> Result<Response, HandleError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            self.shared.settled.wait(&mut state);
        }
    }

    /// Block the current thread for at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`HandleError::TimedOut`] if the handle is still pending after
    /// `timeout`; otherwise the same as [`wait`](Self::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Response, HandleError> {
        let mut state = self.shared.state.lock();
        if let Some(outcome) = state.outcome() {
            return outcome;
        }

        // A deadline `Instant` can not represent never passes
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            drop(state);
            return self.wait_blocking();
        };

        loop {
            if self
                .shared
                .settled
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.outcome().unwrap_or(Err(HandleError::TimedOut));
            }
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
        }
    }

    /// The result if the handle has settled, without waiting
    pub fn try_get(&self) -> Option<Result<Response, HandleError>> {
        self.shared.state.lock().outcome()
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Cancelled)
    }

    /// Cancel the message if it has not settled yet.
    ///
    /// Returns `true` if this call cancelled it. Cancelling a settled handle
    /// does nothing. A delivery already in progress still runs, but its result
    /// is discarded.
    pub fn cancel(&self) -> bool {
        self.settle(State::Cancelled).is_ok()
    }

    pub(crate) fn complete(&self, response: Response) -> Result<(), AlreadySettled> {
        self.settle(State::Completed(response))
    }

    pub(crate) fn fail(&self, error: Arc<DeliveryError>) -> Result<(), AlreadySettled> {
        self.settle(State::Failed(error))
    }

    pub(crate) fn cancelled(&self) -> Result<(), AlreadySettled> {
        self.settle(State::Cancelled)
    }

    fn settle(&self, next: State) -> Result<(), AlreadySettled> {
        {
            let mut state = self.shared.state.lock();
            if let Some(previous) = state.kind() {
                return Err(AlreadySettled { previous });
            }
            *state = next;
        }

        self.shared.settled.notify_all();
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::thread;

    use herald_common::{Message, MulticastResult};

    use super::*;
    use crate::error::TemporaryError;

    fn response() -> Response {
        let message = Message::builder()
            .registration_id("device")
            .collapse_key("k")
            .build()
            .unwrap();
        Response::success(MulticastResult::default(), Arc::new(message))
    }

    #[test]
    fn test_settles_exactly_once() {
        let handle = ResponseHandle::new();
        assert!(!handle.is_done());
        assert!(handle.try_get().is_none());

        handle.complete(response()).unwrap();
        assert!(handle.is_done());

        let error = handle
            .fail(Arc::new(DeliveryError::Temporary(
                TemporaryError::ConnectionClosed,
            )))
            .unwrap_err();
        assert_eq!(error.previous, SettledKind::Completed);
        assert_eq!(
            error.to_string(),
            "Response handle was already settled (completed)"
        );

        assert_eq!(handle.try_get().unwrap().unwrap(), response());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = ResponseHandle::new();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(matches!(handle.try_get(), Some(Err(HandleError::Cancelled))));

        let error = handle.complete(response()).unwrap_err();
        assert_eq!(error.previous, SettledKind::Cancelled);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let handle = ResponseHandle::new();
        handle.complete(response()).unwrap();

        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
        assert!(handle.try_get().unwrap().is_ok());
    }

    #[test]
    fn test_wait_blocking_wakes_on_settle() {
        let handle = ResponseHandle::new();
        let writer = handle.clone();

        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer
                .fail(Arc::new(DeliveryError::Temporary(
                    TemporaryError::ConnectionClosed,
                )))
                .unwrap();
        });

        let result = handle.wait_blocking();
        thread.join().unwrap();

        match result {
            Err(HandleError::Failed(error)) => assert!(error.is_temporary()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_wait_timeout_on_pending_handle() {
        let handle = ResponseHandle::new();
        let started = Instant::now();

        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(30)),
            Err(HandleError::TimedOut)
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!handle.is_done());
    }

    #[test]
    fn test_wait_timeout_without_representable_deadline() {
        let handle = ResponseHandle::new();
        handle.cancel();
        assert!(matches!(
            handle.wait_timeout(Duration::MAX),
            Err(HandleError::Cancelled)
        ));

        let handle = ResponseHandle::new();
        let writer = handle.clone();
        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.complete(response()).unwrap();
        });

        assert_eq!(handle.wait_timeout(Duration::MAX).unwrap(), response());
        thread.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_wait() {
        let handle = ResponseHandle::new();
        let writer = handle.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.complete(response()).unwrap();
        });

        assert_eq!(handle.wait().await.unwrap(), response());
        // Settled handles return immediately
        assert_eq!(handle.wait().await.unwrap(), response());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_wait_sees_cancellation() {
        let handle = ResponseHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.cancel());

        assert!(matches!(task.await.unwrap(), Err(HandleError::Cancelled)));
    }
}
