//! Outstanding delivery acknowledgments.
//!
//! Every `One` delivery and every per-member `Group` delivery opens a record
//! that stays pending until the receiver confirms it, its owning session is
//! disposed, or it runs out of retries.

use crate::session::SessionId;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rmessage_protocol::{ProtocolCategory, TransportMessage};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default time to wait for an acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of re-deliveries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Correlates a delivery with the acknowledgment confirming it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckKey {
    /// Key the message was delivered to.
    pub receiver: Bytes,
    /// Key that sent the message.
    pub sender: Bytes,
    /// Timestamp of the delivered message.
    pub timestamp: u64,
}

impl AckKey {
    /// Key for `message` delivered to `receiver`.
    #[must_use]
    pub fn for_delivery(receiver: &Bytes, message: &TransportMessage) -> Self {
        Self {
            receiver: receiver.clone(),
            sender: message.from_key.clone(),
            timestamp: message.timestamp,
        }
    }

    /// Key confirmed by an acknowledgment frame.
    #[must_use]
    pub fn for_ack(ack: &TransportMessage) -> Self {
        Self {
            receiver: ack.from_key.clone(),
            sender: ack.to_key.clone(),
            timestamp: ack.timestamp,
        }
    }
}

/// Kind of delivery awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// Direct message, confirmed by `OneAck` or `Accept`.
    One,
    /// Group message, confirmed by `GroupAck` or `Accept`.
    Group,
}

impl AckKind {
    /// Whether an acknowledgment of `category` confirms this kind.
    #[must_use]
    pub fn accepts(self, category: ProtocolCategory) -> bool {
        matches!(
            (self, category),
            (_, ProtocolCategory::Accept)
                | (AckKind::One, ProtocolCategory::OneAck)
                | (AckKind::Group, ProtocolCategory::GroupAck)
        )
    }
}

/// A pending acknowledgment.
#[derive(Debug, Clone)]
pub struct AckRecord {
    /// Delivery kind.
    pub kind: AckKind,
    /// Receiver key.
    pub target: Bytes,
    /// The delivered message, kept for re-delivery.
    pub message: TransportMessage,
    /// Session the message was delivered to.
    pub owner: SessionId,
    /// When the first attempt was sent.
    pub sent_at: Instant,
    /// When the current attempt times out.
    pub deadline: Instant,
    /// Delivery attempts so far.
    pub attempts: u32,
}

impl AckRecord {
    /// Correlation key of this record.
    #[must_use]
    pub fn key(&self) -> AckKey {
        AckKey::for_delivery(&self.target, &self.message)
    }
}

/// Acknowledgment tracking configuration.
#[derive(Debug, Clone, Copy)]
pub struct AckConfig {
    /// Time to wait for each attempt.
    pub timeout: Duration,
    /// Re-deliveries after the first attempt.
    pub max_retries: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Table of pending acknowledgments.
///
/// Deliveries sharing a correlation key queue up in send order; an
/// acknowledgment confirms the oldest one it can.
#[derive(Debug)]
pub struct AckTable {
    records: DashMap<AckKey, VecDeque<AckRecord>>,
    config: AckConfig,
}

impl AckTable {
    /// Create an empty table.
    #[must_use]
    pub fn new(config: AckConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    /// Table configuration.
    #[must_use]
    pub fn config(&self) -> &AckConfig {
        &self.config
    }

    /// Open a record for `message` delivered to `target` on session `owner`.
    pub fn open(
        &self,
        kind: AckKind,
        target: Bytes,
        owner: SessionId,
        message: &TransportMessage,
    ) -> AckKey {
        let now = Instant::now();
        let record = AckRecord {
            kind,
            target,
            message: message.clone(),
            owner,
            sent_at: now,
            deadline: now + self.config.timeout,
            attempts: 1,
        };
        let key = record.key();
        trace!(?kind, receiver = ?key.receiver, timestamp = key.timestamp, "Ack opened");
        self.records.entry(key.clone()).or_default().push_back(record);
        key
    }

    /// Close the oldest record confirmed by `ack`.
    ///
    /// Returns `None` when nothing matches, including records of the wrong
    /// kind for the acknowledgment's category.
    pub fn close(&self, ack: &TransportMessage) -> Option<AckRecord> {
        let Entry::Occupied(mut queue) = self.records.entry(AckKey::for_ack(ack)) else {
            return None;
        };

        let index = queue
            .get()
            .iter()
            .position(|record| record.kind.accepts(ack.category))?;
        let record = queue.get_mut().remove(index);
        if queue.get().is_empty() {
            queue.remove();
        }
        record
    }

    /// Drop every record owned by session `owner`. Returns how many.
    pub fn release_session(&self, owner: SessionId) -> usize {
        let mut released = 0;
        self.records.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|record| record.owner != owner);
            released += before - queue.len();
            !queue.is_empty()
        });
        released
    }

    /// Remove and return every record whose deadline is at or before `now`,
    /// oldest first.
    pub fn expire(&self, now: Instant) -> Vec<AckRecord> {
        let mut expired = Vec::new();
        self.records.retain(|_, queue| {
            let (due, pending): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|record| record.deadline <= now);
            expired.extend(due);
            *queue = pending;
            !queue.is_empty()
        });
        expired.sort_by_key(|record| record.sent_at);
        expired
    }

    /// Whether `record` may be delivered again.
    #[must_use]
    pub fn can_retry(&self, record: &AckRecord) -> bool {
        record.attempts <= self.config.max_retries
    }

    /// Put an expired record back for another attempt on session `owner`.
    pub fn rearm(&self, mut record: AckRecord, owner: SessionId, now: Instant) {
        record.attempts += 1;
        record.owner = owner;
        record.deadline = now + self.config.timeout;

        let mut queue = self.records.entry(record.key()).or_default();
        let index = queue.partition_point(|pending| pending.sent_at <= record.sent_at);
        queue.insert(index, record);
    }

    /// Whether a record for `key` is pending.
    #[must_use]
    pub fn contains(&self, key: &AckKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.iter().map(|queue| queue.len()).sum()
    }

    /// Whether no records are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AckTable {
    fn default() -> Self {
        Self::new(AckConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered() -> TransportMessage {
        TransportMessage::one("u1", "u2", "hi").with_timestamp(100)
    }

    #[test]
    fn test_open_and_close() {
        let table = AckTable::default();
        let message = delivered();
        let key = table.open(AckKind::One, message.to_key.clone(), 7, &message);
        assert!(table.contains(&key));

        let ack = message.acknowledge("u2", ProtocolCategory::OneAck);
        let record = table.close(&ack).unwrap();
        assert_eq!(record.owner, 7);
        assert!(table.is_empty());

        // A second ack finds nothing.
        assert!(table.close(&ack).is_none());
    }

    #[test]
    fn test_ack_kind_must_match() {
        let table = AckTable::default();
        let message = delivered();
        table.open(AckKind::One, message.to_key.clone(), 1, &message);

        let wrong = message.acknowledge("u2", ProtocolCategory::GroupAck);
        assert!(table.close(&wrong).is_none());
        assert_eq!(table.len(), 1);

        let accept = message.acknowledge("u2", ProtocolCategory::Accept);
        assert!(table.close(&accept).is_some());
    }

    #[test]
    fn test_unmatched_ack() {
        let table = AckTable::default();
        let message = delivered();
        table.open(AckKind::One, message.to_key.clone(), 1, &message);

        let stale = message
            .acknowledge("u2", ProtocolCategory::OneAck)
            .with_timestamp(99);
        assert!(table.close(&stale).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_key_deliveries_tracked_separately() {
        let table = AckTable::default();
        let first = TransportMessage::one("u1", "u2", "a").with_timestamp(5);
        let second = TransportMessage::one("u1", "u2", "b").with_timestamp(5);
        table.open(AckKind::One, first.to_key.clone(), 1, &first);
        table.open(AckKind::One, second.to_key.clone(), 1, &second);
        assert_eq!(table.len(), 2);

        let ack = first.acknowledge("u2", ProtocolCategory::OneAck);
        assert_eq!(&table.close(&ack).unwrap().message.body[..], b"a");
        assert_eq!(table.len(), 1);
        assert!(table.contains(&AckKey::for_ack(&ack)));

        assert_eq!(&table.close(&ack).unwrap().message.body[..], b"b");
        assert!(table.is_empty());
        assert!(table.close(&ack).is_none());
    }

    #[test]
    fn test_release_session() {
        let table = AckTable::default();
        let first = delivered();
        let second = delivered().with_timestamp(101);
        let third = TransportMessage::one("u1", "u3", "x").with_timestamp(5);
        table.open(AckKind::One, first.to_key.clone(), 1, &first);
        table.open(AckKind::One, second.to_key.clone(), 1, &second);
        table.open(AckKind::One, third.to_key.clone(), 2, &third);

        assert_eq!(table.release_session(1), 2);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_and_rearm() {
        let table = AckTable::new(AckConfig {
            timeout: Duration::from_secs(10),
            max_retries: 1,
        });
        let message = delivered();
        table.open(AckKind::One, message.to_key.clone(), 1, &message);

        assert!(table.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        let expired = table.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty());

        let record = expired.into_iter().next().unwrap();
        assert!(table.can_retry(&record));
        table.rearm(record, 3, Instant::now());
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        let record = table.expire(Instant::now()).pop().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.owner, 3);
        assert!(!table.can_retry(&record));
    }
}
