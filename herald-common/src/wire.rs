//! JSON wire format of the push service
//!
//! Transports use [`RequestBody`] to serialise a [`Message`] and
//! [`decode_response`] to turn the HTTP status, `Retry-After` header and body
//! into a [`Response`]. The HTTP exchange itself is left to the transport.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Message, MulticastResult, Response, ServerResponse, TargetError, TargetResult};

/// Problems decoding a reply from the push service
#[derive(Debug, Error)]
pub enum WireError {
    /// The service answered with a status this codec does not understand
    #[error("Unexpected HTTP status code: {0}")]
    UnexpectedStatus(u16),

    /// The body of a successful reply was not valid multicast JSON
    #[error("Malformed response body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    /// A per-target error code that is not part of the protocol
    #[error("Unexpected error code in response: {0}")]
    UnknownTargetError(String),
}

/// JSON body of a send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestBody<'a> {
    pub registration_ids: &'a [String],
    pub collapse_key: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub delay_while_idle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u32>,
    #[serde(skip_serializing_if = "no_data")]
    pub data: &'a BTreeMap<String, String>,
}

#[allow(
    clippy::trivially_copy_pass_by_ref,
    reason = "serde hands skip predicates a reference to the field"
)]
fn no_data(data: &&BTreeMap<String, String>) -> bool {
    data.is_empty()
}

impl<'a> From<&'a Message> for RequestBody<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            registration_ids: message.registration_ids(),
            collapse_key: message.collapse_key(),
            delay_while_idle: message.delay_while_idle(),
            time_to_live: message.time_to_live(),
            data: message.data(),
        }
    }
}

impl RequestBody<'_> {
    /// Serialise to the JSON sent to the service
    ///
    /// # Errors
    ///
    /// Only fails if serde can not serialise the body, which does not happen
    /// for string maps.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Deserialize)]
struct WireMulticast {
    success: u32,
    failure: u32,
    canonical_ids: u32,
    multicast_id: u64,
    #[serde(default)]
    results: Vec<WireTarget>,
}

#[derive(Deserialize)]
struct WireTarget {
    message_id: Option<String>,
    registration_id: Option<String>,
    error: Option<String>,
}

impl TryFrom<WireTarget> for TargetResult {
    type Error = WireError;

    fn try_from(target: WireTarget) -> Result<Self, Self::Error> {
        let error = match target.error.filter(|error| !error.is_empty()) {
            Some(code) => Some(
                code.parse::<TargetError>()
                    .map_err(WireError::UnknownTargetError)?,
            ),
            None => None,
        };

        Ok(Self {
            message_id: target.message_id.filter(|id| !id.is_empty()),
            canonical_registration_id: target.registration_id.filter(|id| !id.is_empty()),
            error,
        })
    }
}

/// Decode a reply from the push service.
///
/// # Errors
///
/// Fails for statuses other than 200, 401, 500 and 503, for a 200 whose body
/// is not valid multicast JSON, and for unknown per-target error codes.
pub fn decode_response(
    status: u16,
    retry_after: Option<&str>,
    body: &str,
    message: Arc<Message>,
) -> Result<Response, WireError> {
    match status {
        200 => {
            let multicast = decode_multicast(body)?;
            Ok(Response::new(
                ServerResponse::Success,
                Some(multicast),
                None,
                message,
            ))
        }
        401 => Ok(Response::new(
            ServerResponse::Unauthorized,
            None,
            None,
            message,
        )),
        500 => Ok(Response::new(
            ServerResponse::InternalError,
            None,
            None,
            message,
        )),
        503 => {
            let retry_after =
                retry_after.and_then(|value| parse_retry_after(value, SystemTime::now()));
            Ok(Response::new(
                ServerResponse::ServiceUnavailable,
                None,
                retry_after,
                message,
            ))
        }
        other => Err(WireError::UnexpectedStatus(other)),
    }
}

fn decode_multicast(body: &str) -> Result<MulticastResult, WireError> {
    let wire: WireMulticast = serde_json::from_str(body)?;

    let results = wire
        .results
        .into_iter()
        .map(TargetResult::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MulticastResult {
        success: wire.success,
        failure: wire.failure,
        canonical_ids: wire.canonical_ids,
        multicast_id: wire.multicast_id,
        results,
    })
}

/// Interpret a `Retry-After` header, either an HTTP-date or a number of
/// seconds relative to `now`. Unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<SystemTime> {
    let value = value.trim();

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        return Some(SystemTime::from(date));
    }

    value
        .parse::<u64>()
        .ok()
        .map(|seconds| now + Duration::from_secs(seconds))
}
