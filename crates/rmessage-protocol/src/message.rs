//! The protocol message exchanged between clients and the server.
//!
//! Every frame on the wire decodes into exactly one [`TransportMessage`].
//! Which fields are meaningful depends on the category:
//!
//! | category | `from_key` | `to_key` |
//! |---|---|---|
//! | `Online` | client key | empty |
//! | `One` | sender | receiver |
//! | `Group` | sender | group id |
//! | `Join` / `Leave` | member | group id |
//! | `OneAck` / `GroupAck` / `Accept` | receiver | original sender |
//! | `Ping` / `Pong` | empty | empty |
//!
//! Acknowledgments echo the timestamp of the message they confirm.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::category::ProtocolCategory;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Message category.
    pub category: ProtocolCategory,
    /// Originating key.
    pub from_key: Bytes,
    /// Target key or group id.
    pub to_key: Bytes,
    /// Opaque payload.
    pub body: Bytes,
    /// Opaque additional fields.
    pub additional: Bytes,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl TransportMessage {
    /// Create a message with explicit fields and an empty payload.
    #[must_use]
    pub fn new(
        category: ProtocolCategory,
        from_key: impl Into<Bytes>,
        to_key: impl Into<Bytes>,
    ) -> Self {
        Self {
            category,
            from_key: from_key.into(),
            to_key: to_key.into(),
            body: Bytes::new(),
            additional: Bytes::new(),
            timestamp: now_millis(),
        }
    }

    /// Create an `Online` announcement.
    #[must_use]
    pub fn online(key: impl Into<Bytes>) -> Self {
        Self::new(ProtocolCategory::Online, key, Bytes::new())
    }

    /// Create a direct message.
    #[must_use]
    pub fn one(from: impl Into<Bytes>, to: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self::new(ProtocolCategory::One, from, to).with_body(body)
    }

    /// Create a group message.
    #[must_use]
    pub fn group(
        from: impl Into<Bytes>,
        group: impl Into<Bytes>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(ProtocolCategory::Group, from, group).with_body(body)
    }

    /// Create a `Join` request.
    #[must_use]
    pub fn join(key: impl Into<Bytes>, group: impl Into<Bytes>) -> Self {
        Self::new(ProtocolCategory::Join, key, group)
    }

    /// Create a `Leave` request.
    #[must_use]
    pub fn leave(key: impl Into<Bytes>, group: impl Into<Bytes>) -> Self {
        Self::new(ProtocolCategory::Leave, key, group)
    }

    /// Create a header-only `Ping`.
    #[must_use]
    pub fn ping() -> Self {
        Self::control(ProtocolCategory::Ping)
    }

    /// Create a header-only `Pong`.
    #[must_use]
    pub fn pong() -> Self {
        Self::control(ProtocolCategory::Pong)
    }

    fn control(category: ProtocolCategory) -> Self {
        Self {
            category,
            from_key: Bytes::new(),
            to_key: Bytes::new(),
            body: Bytes::new(),
            additional: Bytes::new(),
            timestamp: 0,
        }
    }

    /// Build the acknowledgment a receiver sends back for this message.
    ///
    /// `category` is one of `OneAck`, `GroupAck` or `Accept`.
    #[must_use]
    pub fn acknowledge(&self, receiver: impl Into<Bytes>, category: ProtocolCategory) -> Self {
        Self {
            category,
            from_key: receiver.into(),
            to_key: self.from_key.clone(),
            body: Bytes::new(),
            additional: Bytes::new(),
            timestamp: self.timestamp,
        }
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the additional fields.
    #[must_use]
    pub fn with_additional(mut self, additional: impl Into<Bytes>) -> Self {
        self.additional = additional.into();
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether all declared lengths of this message are zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from_key.is_empty()
            && self.to_key.is_empty()
            && self.body.is_empty()
            && self.additional.is_empty()
    }
}
