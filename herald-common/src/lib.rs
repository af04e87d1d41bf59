//! Shared model for the herald push dispatcher
//!
//! This crate provides:
//! - The immutable outbound [`Message`] and its [`MessageBuilder`]
//! - The [`Response`] returned by the push service, including the per-target
//!   [`MulticastResult`]
//! - The JSON wire codec used by transports
//! - Logging macros and subscriber setup

pub mod logging;
pub mod message;
pub mod response;
pub mod wire;

pub use message::{Message, MessageBuilder, MessageError};
pub use response::{MulticastResult, Response, ServerResponse, TargetError, TargetResult};
pub use tracing;
pub use wire::WireError;
