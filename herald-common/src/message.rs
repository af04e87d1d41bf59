//! Outbound push messages
//!
//! A [`Message`] is immutable once built. Anything that needs a different
//! message (for example a retry narrowed to a subset of recipients) builds a
//! new one with [`Message::retarget`] or a [`MessageBuilder`].

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a [`MessageBuilder`] refuses to build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Required parameter 'registration id' was not specified")]
    MissingRegistrationId,

    #[error("Required parameter 'collapse key' was not specified")]
    MissingCollapseKey,
}

/// A push message addressed to one or more registered devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    registration_ids: Vec<String>,
    collapse_key: String,
    data: BTreeMap<String, String>,
    delay_while_idle: bool,
    time_to_live: Option<u32>,
}

impl Message {
    /// Start building a new message
    #[must_use]
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Devices this message is addressed to, in the order they were added
    pub fn registration_ids(&self) -> &[String] {
        &self.registration_ids
    }

    pub fn collapse_key(&self) -> &str {
        &self.collapse_key
    }

    /// Key/value payload delivered to the device
    pub const fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Whether the service should hold the message until the device is active
    pub const fn delay_while_idle(&self) -> bool {
        self.delay_while_idle
    }

    /// How long, in seconds, the service keeps the message if the device is
    /// offline. `None` leaves the service default in place.
    pub const fn time_to_live(&self) -> Option<u32> {
        self.time_to_live
    }

    /// Build a copy of this message addressed only to `registration_ids`.
    ///
    /// Returns `None` when `registration_ids` is empty, since a message with no
    /// recipients can not be sent.
    #[must_use]
    pub fn retarget<I, S>(&self, registration_ids: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registration_ids = dedup(registration_ids.into_iter().map(Into::into));
        if registration_ids.is_empty() {
            return None;
        }

        Some(Self {
            registration_ids,
            ..self.clone()
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message(registration_ids={:?}, collapse_key={:?}, delay_while_idle={}, time_to_live={:?}, data={:?})",
            self.registration_ids,
            self.collapse_key,
            self.delay_while_idle,
            self.time_to_live,
            self.data
        )
    }
}

/// Builder for [`Message`].
///
/// A builder can be cloned to produce several messages sharing most fields.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    registration_ids: Vec<String>,
    collapse_key: Option<String>,
    data: BTreeMap<String, String>,
    delay_while_idle: bool,
    time_to_live: Option<u32>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the message to a single device, replacing any previous targets
    #[must_use]
    pub fn registration_id(mut self, registration_id: impl Into<String>) -> Self {
        self.registration_ids = vec![registration_id.into()];
        self
    }

    /// Address the message to several devices, replacing any previous targets.
    /// Duplicates are dropped, keeping the first occurrence.
    #[must_use]
    pub fn registration_ids<I, S>(mut self, registration_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registration_ids = dedup(registration_ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn collapse_key(mut self, collapse_key: impl Into<String>) -> Self {
        self.collapse_key = Some(collapse_key.into());
        self
    }

    #[must_use]
    pub const fn delay_while_idle(mut self, delay_while_idle: bool) -> Self {
        self.delay_while_idle = delay_while_idle;
        self
    }

    #[must_use]
    pub const fn time_to_live(mut self, seconds: u32) -> Self {
        self.time_to_live = Some(seconds);
        self
    }

    #[must_use]
    pub fn put(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn put_all<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.data
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn remove(mut self, key: &str) -> Self {
        self.data.remove(key);
        self
    }

    /// Validate and build the message.
    ///
    /// # Errors
    ///
    /// Fails if no registration id or no collapse key was given.
    pub fn build(self) -> Result<Message, MessageError> {
        if self.registration_ids.is_empty() {
            return Err(MessageError::MissingRegistrationId);
        }

        let collapse_key = self.collapse_key.ok_or(MessageError::MissingCollapseKey)?;

        Ok(Message {
            registration_ids: self.registration_ids,
            collapse_key,
            data: self.data,
            delay_while_idle: self.delay_while_idle,
            time_to_live: self.time_to_live,
        })
    }
}

fn dedup(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_build_requires_registration_id() {
        let result = MessageBuilder::new().collapse_key("news").build();
        assert_eq!(result, Err(MessageError::MissingRegistrationId));
    }

    #[test]
    fn test_build_requires_collapse_key() {
        let result = MessageBuilder::new().registration_id("device-1").build();
        assert_eq!(result, Err(MessageError::MissingCollapseKey));
    }

    #[test]
    fn test_build_defaults() {
        let message = Message::builder()
            .registration_id("device-1")
            .collapse_key("news")
            .build()
            .unwrap();

        assert_eq!(message.registration_ids(), ["device-1"]);
        assert_eq!(message.collapse_key(), "news");
        assert!(message.data().is_empty());
        assert!(!message.delay_while_idle());
        assert_eq!(message.time_to_live(), None);
    }

    #[test]
    fn test_registration_ids_dedup_preserves_order() {
        let message = Message::builder()
            .registration_ids(["b", "a", "b", "c", "a"])
            .collapse_key("k")
            .build()
            .unwrap();

        assert_eq!(message.registration_ids(), ["b", "a", "c"]);
    }

    #[test]
    fn test_registration_id_replaces_previous_targets() {
        let message = Message::builder()
            .registration_ids(["a", "b"])
            .registration_id("c")
            .collapse_key("k")
            .build()
            .unwrap();

        assert_eq!(message.registration_ids(), ["c"]);
    }

    #[test]
    fn test_data_put_and_remove() {
        let message = Message::builder()
            .registration_id("a")
            .collapse_key("k")
            .put("title", "hello")
            .put_all([("body", "world"), ("badge", "3")])
            .remove("badge")
            .build()
            .unwrap();

        assert_eq!(message.data().len(), 2);
        assert_eq!(message.data()["title"], "hello");
        assert_eq!(message.data()["body"], "world");
    }

    #[test]
    fn test_builder_clone_is_independent() {
        let base = Message::builder()
            .registration_id("a")
            .collapse_key("k")
            .put("shared", "1");

        let first = base.clone().put("only", "first").build().unwrap();
        let second = base.build().unwrap();

        assert!(first.data().contains_key("only"));
        assert!(!second.data().contains_key("only"));
    }

    #[test]
    fn test_retarget_keeps_everything_but_targets() {
        let message = Message::builder()
            .registration_ids(["a", "b", "c"])
            .collapse_key("k")
            .time_to_live(60)
            .delay_while_idle(true)
            .put("x", "y")
            .build()
            .unwrap();

        let narrowed = message.retarget(["c", "a"]).unwrap();

        assert_eq!(narrowed.registration_ids(), ["c", "a"]);
        assert_eq!(narrowed.collapse_key(), "k");
        assert_eq!(narrowed.time_to_live(), Some(60));
        assert!(narrowed.delay_while_idle());
        assert_eq!(narrowed.data(), message.data());
    }

    #[test]
    fn test_retarget_to_nobody() {
        let message = Message::builder()
            .registration_id("a")
            .collapse_key("k")
            .build()
            .unwrap();

        assert!(message.retarget(Vec::<String>::new()).is_none());
    }
}
