//! Typed error handling for delivery operations.
//!
//! Transports report failures as [`DeliveryError`], split into:
//! - Permanent failures (rejected credentials, invalid requests) - don't retry
//! - Temporary failures (connection problems, timeouts) - retry with backoff
//! - System errors - internal problems, including caught panics
//!
//! Callers waiting on a [`ResponseHandle`](crate::ResponseHandle) see a
//! [`HandleError`].

use std::{sync::Arc, time::Duration};

use herald_common::WireError;
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (internal errors, defects).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The request could not be understood by the service.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The service replied in a way the transport does not understand.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Temporary errors that should be retried with backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to establish a connection to the push service.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The request timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection dropped mid-request.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A filter, handler or transport panicked while processing a message.
    #[error("Defect while processing message: {0}")]
    Defect(String),

    /// The dispatcher's runtime is shutting down.
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Returns `true` if this error came from a caught panic.
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::System(SystemError::Defect(_)))
    }
}

/// Decoding problems mean the service said something we can not act on;
/// sending the same request again will not change that.
impl From<WireError> for DeliveryError {
    fn from(error: WireError) -> Self {
        match error {
            WireError::UnexpectedStatus(status) => Self::Permanent(
                PermanentError::UnexpectedResponse(format!("HTTP status {status}")),
            ),
            WireError::MalformedBody(e) => {
                Self::Permanent(PermanentError::UnexpectedResponse(e.to_string()))
            }
            WireError::UnknownTargetError(code) => Self::Permanent(
                PermanentError::UnexpectedResponse(format!("unknown error code {code}")),
            ),
        }
    }
}

/// Why a [`ResponseHandle`](crate::ResponseHandle) did not yield a response.
#[derive(Debug, Clone, Error)]
pub enum HandleError {
    /// The message was cancelled, by a filter or by the caller.
    #[error("Message delivery was cancelled")]
    Cancelled,

    /// Delivery failed and no handler chose to retry.
    #[error(transparent)]
    Failed(Arc<DeliveryError>),

    /// A bounded wait elapsed before the handle settled.
    #[error("Timed out waiting for a response")]
    TimedOut,
}

/// Returned when something tries to settle a handle a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Response handle was already settled ({previous})")]
pub struct AlreadySettled {
    /// What the handle had already settled to
    pub previous: crate::handle::SettledKind,
}
