//! Scripted transport for dispatcher tests
//!
//! Replies are taken from a script, one step per call; once the script runs
//! out every further call succeeds. Every call is recorded with the message it
//! carried and when it happened, so tests can check ordering, narrowing and
//! timing.
//!
//! ```rust,ignore
//! let transport = MockTransport::builder()
//!     .unavailable(Some(Duration::from_millis(200)))
//!     .success()
//!     .build();
//! ```
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use herald_common::{Message, MulticastResult, Response, ServerResponse, TargetError, TargetResult};
use herald_delivery::{DeliveryError, Transport};
use parking_lot::Mutex;

/// What the transport does on one call
pub enum Step {
    /// Every target accepted
    Success,
    /// `ServiceUnavailable`, with a `Retry-After` this far after the call
    Unavailable(Option<Duration>),
    /// Success with one entry per target, `Some` marking a failed target
    Partial(Vec<Option<TargetError>>),
    /// A bare response with the given classification
    Status(ServerResponse),
    /// Return an error from the transport
    Error(fn() -> DeliveryError),
    /// Panic inside the transport
    Panic(&'static str),
}

/// One recorded call
#[derive(Debug, Clone)]
pub struct Call {
    pub message: Arc<Message>,
    pub at: Instant,
}

impl Call {
    pub fn registration_ids(&self) -> Vec<&str> {
        self.message
            .registration_ids()
            .iter()
            .map(String::as_str)
            .collect()
    }
}

pub struct MockTransport {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    latency: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// A transport that accepts everything
    pub fn accepting() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of calls that were running at the same time
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn reply(step: Step, message: &Arc<Message>) -> Result<Response, DeliveryError> {
        let message = Arc::clone(message);
        match step {
            Step::Success => {
                let results = (0..message.registration_ids().len())
                    .map(|i| TargetResult {
                        message_id: Some(format!("0:{i}")),
                        ..TargetResult::default()
                    })
                    .collect::<Vec<_>>();
                Ok(Response::success(
                    MulticastResult {
                        success: u32::try_from(results.len()).unwrap_or(u32::MAX),
                        multicast_id: 1,
                        results,
                        ..MulticastResult::default()
                    },
                    message,
                ))
            }
            Step::Unavailable(retry_after) => Ok(Response::unavailable(
                retry_after.map(|after| SystemTime::now() + after),
                message,
            )),
            Step::Partial(targets) => {
                let failure = targets.iter().filter(|target| target.is_some()).count();
                let results = targets
                    .into_iter()
                    .map(|error| TargetResult {
                        message_id: error.is_none().then(|| "0:ok".to_string()),
                        error,
                        ..TargetResult::default()
                    })
                    .collect::<Vec<_>>();
                Ok(Response::success(
                    MulticastResult {
                        success: u32::try_from(results.len() - failure).unwrap_or(u32::MAX),
                        failure: u32::try_from(failure).unwrap_or(u32::MAX),
                        multicast_id: 2,
                        results,
                        ..MulticastResult::default()
                    },
                    message,
                ))
            }
            Step::Status(server_response) => {
                Ok(Response::new(server_response, None, None, message))
            }
            Step::Error(make) => Err(make()),
            Step::Panic(reason) => panic!("{reason}"),
        }
    }
}

impl Transport for MockTransport {
    fn deliver(&self, message: &Arc<Message>) -> Result<Response, DeliveryError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        self.calls.lock().push(Call {
            message: Arc::clone(message),
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let step = self.script.lock().pop_front().unwrap_or(Step::Success);
        self.active.fetch_sub(1, Ordering::SeqCst);

        Self::reply(step, message)
    }
}

#[derive(Default)]
pub struct MockTransportBuilder {
    script: VecDeque<Step>,
    latency: Duration,
}

impl MockTransportBuilder {
    pub fn step(mut self, step: Step) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn success(self) -> Self {
        self.step(Step::Success)
    }

    pub fn unavailable(self, retry_after: Option<Duration>) -> Self {
        self.step(Step::Unavailable(retry_after))
    }

    pub fn partial(self, targets: Vec<Option<TargetError>>) -> Self {
        self.step(Step::Partial(targets))
    }

    pub fn error(self, make: fn() -> DeliveryError) -> Self {
        self.step(Step::Error(make))
    }

    /// Repeat `make` as the reply for the next `times` calls
    pub fn errors(mut self, times: usize, make: fn() -> DeliveryError) -> Self {
        for _ in 0..times {
            self = self.error(make);
        }
        self
    }

    pub fn panic(self, reason: &'static str) -> Self {
        self.step(Step::Panic(reason))
    }

    /// Block each call for `latency` before replying
    pub const fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            script: Mutex::new(self.script),
            calls: Mutex::new(Vec::new()),
            latency: self.latency,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }
}
