//! Responses from the push service
//!
//! A [`Response`] is produced by a transport for every round trip that reached
//! the service, whether or not the service accepted the message. Transport
//! level problems (connection refused, malformed replies) are reported as
//! errors instead and never appear here.

use std::{fmt, str::FromStr, sync::Arc, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::Message;

/// Outcome of a request as a whole, as classified by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerResponse {
    /// The request was accepted. Individual targets may still have failed,
    /// see [`MulticastResult`].
    Success,
    /// The service is overloaded or down; retry later, honouring any
    /// `Retry-After` signal.
    ServiceUnavailable,
    /// The sender credentials were rejected.
    Unauthorized,
    /// The service failed while handling the request.
    InternalError,
}

impl fmt::Display for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Unauthorized => "Unauthorized",
            Self::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Per-target error codes reported inside a successful multicast response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetError {
    MissingRegistration,
    InvalidRegistration,
    MismatchSenderId,
    NotRegistered,
    MessageTooBig,
    InvalidDataKey,
    InvalidTtl,
    /// The service could not reach the device in time (`Unavailable`)
    ServiceUnavailable,
    /// The service failed for this target (`InternalServerError`)
    InternalError,
    InvalidPackageName,
}

impl TargetError {
    /// Whether sending the same message to the same target again may succeed
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ServiceUnavailable | Self::InternalError)
    }

    /// The name used for this error on the wire
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::MissingRegistration => "MissingRegistration",
            Self::InvalidRegistration => "InvalidRegistration",
            Self::MismatchSenderId => "MismatchSenderId",
            Self::NotRegistered => "NotRegistered",
            Self::MessageTooBig => "MessageTooBig",
            Self::InvalidDataKey => "InvalidDataKey",
            Self::InvalidTtl => "InvalidTtl",
            Self::ServiceUnavailable => "Unavailable",
            Self::InternalError => "InternalServerError",
            Self::InvalidPackageName => "InvalidPackageName",
        }
    }
}

impl FromStr for TargetError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "MissingRegistration" => Self::MissingRegistration,
            "InvalidRegistration" => Self::InvalidRegistration,
            "MismatchSenderId" => Self::MismatchSenderId,
            "NotRegistered" => Self::NotRegistered,
            "MessageTooBig" => Self::MessageTooBig,
            "InvalidDataKey" => Self::InvalidDataKey,
            "InvalidTtl" => Self::InvalidTtl,
            "Unavailable" => Self::ServiceUnavailable,
            "InternalServerError" => Self::InternalError,
            "InvalidPackageName" => Self::InvalidPackageName,
            other => return Err(other.to_string()),
        })
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Outcome for one target of a multicast request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Service-assigned id, present when the target accepted the message
    pub message_id: Option<String>,
    /// Set when the device is now known under a different registration id
    pub canonical_registration_id: Option<String>,
    pub error: Option<TargetError>,
}

impl TargetResult {
    pub const fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Structured outcome of an accepted multicast request.
///
/// `results` holds one entry per registration id of the request, in the same
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastResult {
    pub success: u32,
    pub failure: u32,
    pub canonical_ids: u32,
    pub multicast_id: u64,
    pub results: Vec<TargetResult>,
}

impl MulticastResult {
    /// Pair each failed sub-result with the registration id it belongs to.
    ///
    /// Sub-results beyond the message's recipient list are ignored.
    pub fn failed_targets<'m>(&self, message: &'m Message) -> Vec<(&'m str, TargetError)> {
        message
            .registration_ids()
            .iter()
            .zip(&self.results)
            .filter_map(|(id, result)| result.error.map(|error| (id.as_str(), error)))
            .collect()
    }

    /// Registration ids whose delivery failed with a retryable error
    pub fn retryable_targets<'m>(&self, message: &'m Message) -> Vec<&'m str> {
        self.failed_targets(message)
            .into_iter()
            .filter(|(_, error)| error.is_retryable())
            .map(|(id, _)| id)
            .collect()
    }
}

/// Reply of the push service to one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    server_response: ServerResponse,
    result: Option<MulticastResult>,
    retry_after: Option<SystemTime>,
    message: Arc<Message>,
}

impl Response {
    pub const fn new(
        server_response: ServerResponse,
        result: Option<MulticastResult>,
        retry_after: Option<SystemTime>,
        message: Arc<Message>,
    ) -> Self {
        Self {
            server_response,
            result,
            retry_after,
            message,
        }
    }

    /// A plain successful response with every target accepted
    pub fn success(result: MulticastResult, message: Arc<Message>) -> Self {
        Self::new(ServerResponse::Success, Some(result), None, message)
    }

    /// A `ServiceUnavailable` response, optionally carrying a `Retry-After`
    pub const fn unavailable(retry_after: Option<SystemTime>, message: Arc<Message>) -> Self {
        Self::new(ServerResponse::ServiceUnavailable, None, retry_after, message)
    }

    pub const fn server_response(&self) -> ServerResponse {
        self.server_response
    }

    /// Multicast result, only present for [`ServerResponse::Success`]
    pub const fn result(&self) -> Option<&MulticastResult> {
        self.result.as_ref()
    }

    /// Earliest time the service wants to see another request
    pub const fn retry_after(&self) -> Option<SystemTime> {
        self.retry_after
    }

    /// The message this response answers
    pub const fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Number of targets that failed, zero when there is no multicast result
    pub fn failure_count(&self) -> u32 {
        self.result.as_ref().map_or(0, |result| result.failure)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response(server_response={}, result={:?}, retry_after={:?}, message={})",
            self.server_response, self.result, self.retry_after, self.message
        )
    }
}
