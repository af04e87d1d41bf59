//! The synchronous round trip to the push service
//!
//! The dispatcher only knows [`Transport`]. [`JsonTransport`] implements it on
//! top of any [`Exchange`] that can POST a JSON body, using the wire codec
//! from `herald-common` on both sides of the exchange.

use std::sync::Arc;

use herald_common::{
    Message, Response, reply, request,
    wire::{RequestBody, decode_response},
};

use crate::error::{DeliveryError, PermanentError};

/// Performs one blocking round trip to the push service.
///
/// Called from the blocking pool, possibly from several threads at once.
pub trait Transport: Send + Sync + 'static {
    /// Send `message` and return the service's reply.
    ///
    /// # Errors
    ///
    /// Any transport or protocol problem that kept the service from producing
    /// a response.
    fn deliver(&self, message: &Arc<Message>) -> Result<Response, DeliveryError>;
}

impl<F> Transport for F
where
    F: Fn(&Arc<Message>) -> Result<Response, DeliveryError> + Send + Sync + 'static,
{
    fn deliver(&self, message: &Arc<Message>) -> Result<Response, DeliveryError> {
        self(message)
    }
}

/// Raw HTTP reply, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    pub status: u16,
    /// Value of the `Retry-After` header, if any
    pub retry_after: Option<String>,
    pub body: String,
}

/// Something that can POST a JSON body to the push service endpoint.
pub trait Exchange: Send + Sync + 'static {
    /// # Errors
    ///
    /// Connection level problems; HTTP error statuses are not errors here.
    fn post_json(&self, body: &str) -> Result<RawReply, DeliveryError>;
}

/// [`Transport`] speaking the service's JSON protocol over an [`Exchange`]
#[derive(Debug)]
pub struct JsonTransport<E> {
    exchange: E,
}

impl<E: Exchange> JsonTransport<E> {
    pub const fn new(exchange: E) -> Self {
        Self { exchange }
    }
}

impl<E: Exchange> Transport for JsonTransport<E> {
    fn deliver(&self, message: &Arc<Message>) -> Result<Response, DeliveryError> {
        let body = RequestBody::from(message.as_ref())
            .to_json()
            .map_err(|e| PermanentError::InvalidRequest(e.to_string()))?;

        request!(collapse_key = message.collapse_key(), %body, "Sending request");
        let raw = self.exchange.post_json(&body)?;
        reply!(
            status = raw.status,
            retry_after = raw.retry_after.as_deref(),
            body = %raw.body,
            "Received reply"
        );

        Ok(decode_response(
            raw.status,
            raw.retry_after.as_deref(),
            &raw.body,
            Arc::clone(message),
        )?)
    }
}
