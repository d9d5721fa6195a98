//! Message routing.
//!
//! The distributor maps one decoded message from one session onto the
//! registry and the acknowledgment table and reports what happened. It keeps
//! no state of its own; an absent target is a normal [`Distribution`], never
//! an error.

use crate::ack::{AckKind, AckTable};
use crate::registry::{Key, SessionRegistry};
use crate::session::{ConnectionSession, DeliveryError, SessionError};
use bytes::Bytes;
use rmessage_protocol::{ProtocolCategory, TransportMessage};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Reasons a message is refused without being routed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// A message that must name a group did not.
    #[error("Missing group id")]
    EmptyGroup,

    /// The session has not bound a key yet.
    #[error("Session has not identified")]
    Anonymous,

    /// The message names a sender other than the session's key.
    #[error("Sender {claimed:?} does not match session key {bound:?}")]
    SenderMismatch {
        /// Sender named by the message.
        claimed: Bytes,
        /// Key the session is bound to.
        bound: Bytes,
    },

    /// The sender could not be identified.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Delivery status of one group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Queued on the member's session.
    Delivered,
    /// No live session for the member.
    Absent,
    /// The member's outbound queue overflowed.
    QueueFull,
}

/// Per-member outcome of a group fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    /// Target group.
    pub group: Bytes,
    /// Status of every member the message was addressed to.
    pub members: Vec<(Bytes, MemberStatus)>,
}

impl FanoutReport {
    /// Members the message was queued for.
    pub fn delivered(&self) -> impl Iterator<Item = &Bytes> {
        self.members
            .iter()
            .filter(|(_, status)| *status == MemberStatus::Delivered)
            .map(|(key, _)| key)
    }

    /// Members that could not be reached.
    pub fn failed(&self) -> impl Iterator<Item = (&Bytes, MemberStatus)> {
        self.members
            .iter()
            .filter(|(_, status)| *status != MemberStatus::Delivered)
            .map(|(key, status)| (key, *status))
    }

    /// Some, but not all, members were unreachable.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        let failed = self.failed().count();
        failed > 0 && failed < self.members.len()
    }

    /// Status recorded for `member`.
    #[must_use]
    pub fn status_of(&self, member: &[u8]) -> Option<MemberStatus> {
        self.members
            .iter()
            .find(|(key, _)| key.as_ref() == member)
            .map(|(_, status)| *status)
    }
}

/// Outcome of distributing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distribution {
    /// Direct message queued on the target session.
    Delivered {
        /// Receiver key.
        target: Bytes,
    },
    /// Direct message target is not online.
    TargetAbsent {
        /// Receiver key.
        target: Bytes,
    },
    /// Direct message target is online but its queue overflowed.
    DeliveryFailed {
        /// Receiver key.
        target: Bytes,
        /// Delivery error.
        error: DeliveryError,
    },
    /// Group message fan-out.
    Fanout(FanoutReport),
    /// A pending acknowledgment was closed.
    Acknowledged {
        /// Key that confirmed the delivery.
        receiver: Bytes,
        /// Whether the confirmation was relayed to the original sender.
        forwarded: bool,
    },
    /// No pending acknowledgment matched.
    AckUnmatched,
    /// Key announced online.
    Online {
        /// Announced key.
        key: Bytes,
        /// Whether a previous session for the key was disposed.
        replaced: bool,
        /// Co-members notified.
        notified: usize,
    },
    /// Group membership added.
    Joined {
        /// Group id.
        group: Bytes,
        /// Whether the membership is new.
        changed: bool,
        /// Members notified.
        notified: usize,
    },
    /// Group membership removed.
    Left {
        /// Group id.
        group: Bytes,
        /// Whether the key was a member.
        changed: bool,
        /// Members notified.
        notified: usize,
    },
    /// The client signed off; its session was disposed.
    SignedOff,
    /// A pong was queued in reply to a ping.
    Ponged,
    /// A pong reset the heartbeat counter.
    HeartbeatReset,
    /// The message was refused.
    Rejected(RouteError),
}

impl Distribution {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Distribution::Delivered { .. } => "delivered",
            Distribution::TargetAbsent { .. } => "target_absent",
            Distribution::DeliveryFailed { .. } => "delivery_failed",
            Distribution::Fanout(report) if report.is_partial() => "fanout_partial",
            Distribution::Fanout(_) => "fanout",
            Distribution::Acknowledged { .. } => "acknowledged",
            Distribution::AckUnmatched => "ack_unmatched",
            Distribution::Online { .. } => "online",
            Distribution::Joined { .. } => "joined",
            Distribution::Left { .. } => "left",
            Distribution::SignedOff => "signed_off",
            Distribution::Ponged => "ponged",
            Distribution::HeartbeatReset => "heartbeat_reset",
            Distribution::Rejected(_) => "rejected",
        }
    }
}

/// Summary of a session teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    /// Groups the key was removed from.
    pub groups: usize,
    /// Pending acknowledgments dropped.
    pub released_acks: usize,
    /// Remaining members notified of the departure.
    pub notified: usize,
}

/// Summary of an acknowledgment sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records re-delivered.
    pub retried: usize,
    /// Records given up on.
    pub dropped: usize,
}

/// Distributor configuration.
#[derive(Debug, Clone, Copy)]
pub struct DistributorConfig {
    /// Broadcast join/leave to the group's other members.
    pub broadcast_membership: bool,
    /// Broadcast online announcements to co-members.
    pub broadcast_presence: bool,
    /// Relay matched acknowledgments to the original sender.
    pub forward_acks: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            broadcast_membership: true,
            broadcast_presence: true,
            forward_acks: true,
        }
    }
}

/// Routes decoded messages between sessions.
pub struct MessageDistributor {
    registry: Arc<SessionRegistry>,
    acks: Arc<AckTable>,
    config: DistributorConfig,
}

impl MessageDistributor {
    /// Create a distributor over a registry and an acknowledgment table.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        acks: Arc<AckTable>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            registry,
            acks,
            config,
        }
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The acknowledgment table.
    #[must_use]
    pub fn acks(&self) -> &Arc<AckTable> {
        &self.acks
    }

    /// Route `message` received on `session`.
    pub fn distribute(
        &self,
        session: &Arc<ConnectionSession>,
        message: TransportMessage,
    ) -> Distribution {
        trace!(
            session = session.id(),
            category = %message.category,
            "Distributing message"
        );

        match message.category {
            ProtocolCategory::One
            | ProtocolCategory::Group
            | ProtocolCategory::OneAck
            | ProtocolCategory::GroupAck
            | ProtocolCategory::Accept => {
                if let Err(err) = Self::check_sender(session, &message) {
                    debug!(
                        session = session.id(),
                        category = %message.category,
                        error = %err,
                        "Message refused"
                    );
                    return Distribution::Rejected(err);
                }
                match message.category {
                    ProtocolCategory::One => self.route_one(message),
                    ProtocolCategory::Group => self.route_group(message),
                    _ => self.acknowledge(message),
                }
            }
            ProtocolCategory::Online => self.online(session, message),
            ProtocolCategory::Join => self.join(session, message),
            ProtocolCategory::Leave => self.leave(session, message),
            ProtocolCategory::Ping => match session.deliver_urgent(TransportMessage::pong()) {
                Ok(()) => Distribution::Ponged,
                Err(error) => Distribution::DeliveryFailed {
                    target: session.key().cloned().unwrap_or_default(),
                    error,
                },
            },
            ProtocolCategory::Pong => {
                session.reset_heartbeat();
                Distribution::HeartbeatReset
            }
        }
    }

    fn route_one(&self, message: TransportMessage) -> Distribution {
        let target = message.to_key.clone();
        let Some(session) = self.registry.resolve(&target) else {
            debug!(target = ?target, "Direct message target absent");
            return Distribution::TargetAbsent { target };
        };

        let owner = session.id();
        let record = message.clone();
        match session.deliver(message) {
            Ok(()) => {
                self.acks.open(AckKind::One, target.clone(), owner, &record);
                Distribution::Delivered { target }
            }
            Err(DeliveryError::Closed) => Distribution::TargetAbsent { target },
            Err(error) => Distribution::DeliveryFailed { target, error },
        }
    }

    fn route_group(&self, message: TransportMessage) -> Distribution {
        let group = message.to_key.clone();
        let mut members: Vec<Bytes> = self
            .registry
            .members(&group)
            .into_iter()
            .filter(|member| *member != message.from_key)
            .collect();
        members.sort();

        let members = members
            .into_iter()
            .map(|member| {
                let status = match self.registry.resolve(&member) {
                    None => MemberStatus::Absent,
                    Some(session) => match session.deliver(message.clone()) {
                        Ok(()) => {
                            self.acks
                                .open(AckKind::Group, member.clone(), session.id(), &message);
                            MemberStatus::Delivered
                        }
                        Err(DeliveryError::Closed) => MemberStatus::Absent,
                        Err(DeliveryError::QueueFull) => MemberStatus::QueueFull,
                    },
                };
                (member, status)
            })
            .collect();

        let report = FanoutReport { group, members };
        if report.failed().next().is_some() {
            debug!(
                group = ?report.group,
                failed = report.failed().count(),
                total = report.members.len(),
                "Group fan-out incomplete"
            );
        }
        Distribution::Fanout(report)
    }

    fn acknowledge(&self, ack: TransportMessage) -> Distribution {
        let Some(record) = self.acks.close(&ack) else {
            trace!(category = %ack.category, from = ?ack.from_key, "Unmatched acknowledgment dropped");
            return Distribution::AckUnmatched;
        };

        let forwarded = self.config.forward_acks
            && self
                .registry
                .resolve(&record.message.from_key)
                .map(|sender| sender.deliver(ack.clone()).is_ok())
                .unwrap_or(false);

        Distribution::Acknowledged {
            receiver: record.target,
            forwarded,
        }
    }

    /// Messages relayed to other keys must carry the session's own key.
    fn check_sender(
        session: &ConnectionSession,
        message: &TransportMessage,
    ) -> Result<(), RouteError> {
        match session.key() {
            None => Err(RouteError::Anonymous),
            Some(bound) if *bound != message.from_key => Err(RouteError::SenderMismatch {
                claimed: message.from_key.clone(),
                bound: bound.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Bind `key` to `session` and register it, if not already.
    ///
    /// Returns whether another session was displaced.
    fn identify(&self, session: &Arc<ConnectionSession>, key: &Key) -> Result<bool, SessionError> {
        session.bind_key(key.clone())?;
        if self.registry.session_id(key) == Some(session.id()) {
            return Ok(false);
        }
        Ok(self.registry.register(key.clone(), session.clone()).is_some())
    }

    /// The key a membership message acts for.
    fn member_key(
        &self,
        session: &Arc<ConnectionSession>,
        message: &TransportMessage,
    ) -> Result<Key, RouteError> {
        if message.from_key.is_empty() {
            return session
                .key()
                .cloned()
                .ok_or(RouteError::Session(SessionError::EmptyKey));
        }
        self.identify(session, &message.from_key)?;
        Ok(message.from_key.clone())
    }

    fn online(&self, session: &Arc<ConnectionSession>, message: TransportMessage) -> Distribution {
        let key = message.from_key.clone();
        let replaced = match self.identify(session, &key) {
            Ok(replaced) => replaced,
            Err(err) => {
                warn!(session = session.id(), error = %err, "Online rejected");
                return Distribution::Rejected(err.into());
            }
        };

        let notified = if self.config.broadcast_presence {
            let peers: HashSet<Key> = self
                .registry
                .groups_of(&key)
                .iter()
                .flat_map(|group| self.registry.members(group))
                .filter(|member| *member != key)
                .collect();
            self.notify(peers, &TransportMessage::online(key.clone()).with_timestamp(message.timestamp))
        } else {
            0
        };

        Distribution::Online {
            key,
            replaced,
            notified,
        }
    }

    fn join(&self, session: &Arc<ConnectionSession>, message: TransportMessage) -> Distribution {
        let group = message.to_key.clone();
        if group.is_empty() {
            return Distribution::Rejected(RouteError::EmptyGroup);
        }
        let key = match self.member_key(session, &message) {
            Ok(key) => key,
            Err(err) => return Distribution::Rejected(err),
        };

        let changed = self.registry.join(&key, &group);
        let notified = if changed && self.config.broadcast_membership {
            let notice = TransportMessage::join(key.clone(), group.clone())
                .with_timestamp(message.timestamp);
            self.notify_group(&group, &key, &notice)
        } else {
            0
        };

        Distribution::Joined {
            group,
            changed,
            notified,
        }
    }

    fn leave(&self, session: &Arc<ConnectionSession>, message: TransportMessage) -> Distribution {
        let group = message.to_key.clone();
        if group.is_empty() {
            session.dispose();
            return Distribution::SignedOff;
        }
        let key = match self.member_key(session, &message) {
            Ok(key) => key,
            Err(err) => return Distribution::Rejected(err),
        };

        let changed = self.registry.leave(&key, &group);
        let notified = if changed && self.config.broadcast_membership {
            let notice = TransportMessage::leave(key.clone(), group.clone())
                .with_timestamp(message.timestamp);
            self.notify_group(&group, &key, &notice)
        } else {
            0
        };

        Distribution::Left {
            group,
            changed,
            notified,
        }
    }

    /// Tear down `session`: dispose it, drop its pending acknowledgments and
    /// registry entries, and tell remaining group members it left.
    pub fn disconnect(&self, session: &Arc<ConnectionSession>) -> DisconnectReport {
        session.dispose();
        let released_acks = self.acks.release_session(session.id());
        let groups = self.registry.unregister(session);

        let mut notified = 0;
        if self.config.broadcast_membership {
            if let Some(key) = session.key() {
                for group in &groups {
                    let notice = TransportMessage::leave(key.clone(), group.clone());
                    notified += self.notify_group(group, key, &notice);
                }
            }
        }

        debug!(
            session = session.id(),
            groups = groups.len(),
            released_acks,
            notified,
            "Session disconnected"
        );

        DisconnectReport {
            groups: groups.len(),
            released_acks,
            notified,
        }
    }

    /// Re-deliver or drop acknowledgments whose deadline has passed.
    pub fn sweep_acks(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for record in self.acks.expire(now) {
            if self.acks.can_retry(&record) {
                if let Some(session) = self.registry.resolve(&record.target) {
                    if session.deliver(record.message.clone()).is_ok() {
                        trace!(target = ?record.target, attempt = record.attempts + 1, "Re-delivered");
                        self.acks.rearm(record, session.id(), now);
                        report.retried += 1;
                        continue;
                    }
                }
            }

            warn!(
                target = ?record.target,
                sender = ?record.message.from_key,
                attempts = record.attempts,
                "Delivery unacknowledged, giving up"
            );
            report.dropped += 1;
        }

        report
    }

    fn notify_group(&self, group: &Key, except: &Key, notice: &TransportMessage) -> usize {
        let members = self
            .registry
            .members(group)
            .into_iter()
            .filter(|member| member != except);
        self.notify(members, notice)
    }

    fn notify(&self, keys: impl IntoIterator<Item = Key>, notice: &TransportMessage) -> usize {
        keys.into_iter()
            .filter_map(|key| self.registry.resolve(&key))
            .filter(|session| session.deliver(notice.clone()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckConfig;
    use crate::session::{SessionConfig, SessionOutbound, SessionState};
    use std::time::Duration;

    fn distributor() -> MessageDistributor {
        MessageDistributor::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(AckTable::default()),
            DistributorConfig::default(),
        )
    }

    fn connect(
        distributor: &MessageDistributor,
        key: &'static str,
    ) -> (Arc<ConnectionSession>, SessionOutbound) {
        let (session, rx) = ConnectionSession::new(SessionConfig::default(), None);
        let outcome = distributor.distribute(&session, TransportMessage::online(key));
        assert!(matches!(outcome, Distribution::Online { .. }));
        (session, rx)
    }

    fn drain(rx: &mut SessionOutbound) -> Vec<TransportMessage> {
        std::iter::from_fn(|| rx.try_recv()).collect()
    }

    #[test]
    fn test_one_to_absent_key() {
        let distributor = distributor();
        let (sender, _rx) = connect(&distributor, "u1");

        let outcome = distributor.distribute(&sender, TransportMessage::one("u1", "nobody", "hi"));

        assert_eq!(
            outcome,
            Distribution::TargetAbsent {
                target: Bytes::from_static(b"nobody")
            }
        );
        assert!(!sender.is_closed());
        assert!(distributor.acks().is_empty());
    }

    #[test]
    fn test_one_delivered_and_acknowledged() {
        let distributor = distributor();
        let (sender, mut sender_rx) = connect(&distributor, "u1");
        let (receiver, mut receiver_rx) = connect(&distributor, "u2");

        let message = TransportMessage::one("u1", "u2", "hi").with_timestamp(1_700_000_000_000);
        let outcome = distributor.distribute(&sender, message.clone());
        assert!(matches!(outcome, Distribution::Delivered { .. }));
        assert_eq!(drain(&mut receiver_rx), vec![message.clone()]);
        assert_eq!(distributor.acks().len(), 1);

        let ack = message.acknowledge("u2", ProtocolCategory::OneAck);
        let outcome = distributor.distribute(&receiver, ack.clone());
        assert_eq!(
            outcome,
            Distribution::Acknowledged {
                receiver: Bytes::from_static(b"u2"),
                forwarded: true
            }
        );
        assert!(distributor.acks().is_empty());
        assert_eq!(drain(&mut sender_rx), vec![ack]);
    }

    #[test]
    fn test_unmatched_ack_dropped() {
        let distributor = distributor();
        let (session, mut rx) = connect(&distributor, "u2");

        let ack = TransportMessage::one("u1", "u2", "hi").acknowledge("u2", ProtocolCategory::OneAck);
        assert_eq!(distributor.distribute(&session, ack), Distribution::AckUnmatched);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_group_partial_failure() {
        let distributor = distributor();
        let (sender, _srx) = connect(&distributor, "s");
        let (_a, mut a_rx) = connect(&distributor, "a");
        let (_c, mut c_rx) = connect(&distributor, "c");

        let registry = distributor.registry();
        for member in ["a", "b", "c"] {
            registry.join(&Bytes::from_static(member.as_bytes()), &Bytes::from_static(b"g"));
        }

        let message = TransportMessage::group("s", "g", "hello");
        let Distribution::Fanout(report) = distributor.distribute(&sender, message.clone()) else {
            panic!("expected fan-out");
        };

        assert!(report.is_partial());
        assert_eq!(report.status_of(b"a"), Some(MemberStatus::Delivered));
        assert_eq!(report.status_of(b"b"), Some(MemberStatus::Absent));
        assert_eq!(report.status_of(b"c"), Some(MemberStatus::Delivered));
        assert_eq!(drain(&mut a_rx), vec![message.clone()]);
        assert_eq!(drain(&mut c_rx), vec![message]);
        assert_eq!(distributor.acks().len(), 2);
    }

    #[test]
    fn test_group_member_queue_full() {
        let distributor = distributor();
        let (sender, _srx) = connect(&distributor, "s");
        let (_a, mut a_rx) = connect(&distributor, "a");
        let (full, _full_rx) = ConnectionSession::new(
            SessionConfig {
                outbound_capacity: 1,
                ..SessionConfig::default()
            },
            None,
        );
        distributor.distribute(&full, TransportMessage::online("f"));
        full.deliver(TransportMessage::one("x", "f", "backlog")).unwrap();

        let registry = distributor.registry();
        for member in ["a", "f"] {
            registry.join(&Bytes::from_static(member.as_bytes()), &Bytes::from_static(b"g"));
        }

        let message = TransportMessage::group("s", "g", "hello");
        let Distribution::Fanout(report) = distributor.distribute(&sender, message.clone()) else {
            panic!("expected fan-out");
        };

        assert!(report.is_partial());
        assert_eq!(report.status_of(b"a"), Some(MemberStatus::Delivered));
        assert_eq!(report.status_of(b"f"), Some(MemberStatus::QueueFull));
        assert_eq!(drain(&mut a_rx), vec![message]);
        assert!(!full.is_closed());
        assert_eq!(distributor.acks().len(), 1);
    }

    #[test]
    fn test_forged_sender_rejected() {
        let distributor = distributor();
        let (mallory, _mrx) = connect(&distributor, "mallory");
        let (_alice, _arx) = connect(&distributor, "alice");
        let (_u2, mut rx) = connect(&distributor, "u2");

        let outcome = distributor.distribute(&mallory, TransportMessage::one("alice", "u2", "hi"));
        assert_eq!(
            outcome,
            Distribution::Rejected(RouteError::SenderMismatch {
                claimed: Bytes::from_static(b"alice"),
                bound: Bytes::from_static(b"mallory"),
            })
        );
        let outcome = distributor.distribute(&mallory, TransportMessage::group("alice", "g", "hi"));
        assert!(matches!(
            outcome,
            Distribution::Rejected(RouteError::SenderMismatch { .. })
        ));
        assert!(drain(&mut rx).is_empty());
        assert!(distributor.acks().is_empty());
    }

    #[test]
    fn test_anonymous_sender_rejected() {
        let distributor = distributor();
        let (_u2, mut rx) = connect(&distributor, "u2");
        let (anonymous, _anon_rx) = ConnectionSession::new(SessionConfig::default(), None);

        let outcome = distributor.distribute(&anonymous, TransportMessage::one("bob", "u2", "hi"));
        assert_eq!(outcome, Distribution::Rejected(RouteError::Anonymous));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(anonymous.state(), SessionState::Connected);
        assert!(!distributor.registry().is_online(b"bob"));
    }

    #[test]
    fn test_forged_ack_does_not_close_record() {
        let distributor = distributor();
        let (sender, mut sender_rx) = connect(&distributor, "u1");
        let (_receiver, _rx) = connect(&distributor, "u2");
        let (mallory, _mrx) = connect(&distributor, "mallory");

        let message = TransportMessage::one("u1", "u2", "hi").with_timestamp(9);
        distributor.distribute(&sender, message.clone());

        let forged = message.acknowledge("u2", ProtocolCategory::OneAck);
        assert!(matches!(
            distributor.distribute(&mallory, forged),
            Distribution::Rejected(RouteError::SenderMismatch { .. })
        ));
        assert_eq!(distributor.acks().len(), 1);
        assert!(drain(&mut sender_rx).is_empty());
    }

    #[test]
    fn test_group_skips_sender_and_disposed_members() {
        let distributor = distributor();
        let (a, mut a_rx) = connect(&distributor, "a");
        let (b, _b_rx) = connect(&distributor, "b");
        distributor.distribute(&a, TransportMessage::join("a", "g"));
        distributor.distribute(&b, TransportMessage::join("b", "g"));
        drain(&mut a_rx);

        b.dispose();
        let Distribution::Fanout(report) =
            distributor.distribute(&a, TransportMessage::group("a", "g", "x"))
        else {
            panic!("expected fan-out");
        };

        assert_eq!(report.members.len(), 1);
        assert_eq!(report.status_of(b"b"), Some(MemberStatus::Absent));
        assert!(report.status_of(b"a").is_none());
        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn test_ping_replies_pong_first() {
        let distributor = distributor();
        let (session, mut rx) = connect(&distributor, "u1");
        session.deliver(TransportMessage::one("x", "u1", "pending")).unwrap();

        assert_eq!(
            distributor.distribute(&session, TransportMessage::ping()),
            Distribution::Ponged
        );

        let written = drain(&mut rx);
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], TransportMessage::pong());
        assert_eq!(&written[1].body[..], b"pending");
    }

    #[test]
    fn test_pong_resets_heartbeat() {
        let distributor = distributor();
        let (session, _rx) = connect(&distributor, "u1");
        session.record_missed_heartbeat();

        assert_eq!(
            distributor.distribute(&session, TransportMessage::pong()),
            Distribution::HeartbeatReset
        );
        assert_eq!(session.missed_heartbeats(), 0);
    }

    #[test]
    fn test_join_identifies_and_broadcasts() {
        let distributor = distributor();
        let (a, mut a_rx) = connect(&distributor, "a");
        distributor.distribute(&a, TransportMessage::join("a", "g"));

        let (b, _b_rx) = ConnectionSession::new(SessionConfig::default(), None);
        let outcome = distributor.distribute(&b, TransportMessage::join("b", "g"));
        assert_eq!(
            outcome,
            Distribution::Joined {
                group: Bytes::from_static(b"g"),
                changed: true,
                notified: 1
            }
        );
        assert_eq!(b.state(), SessionState::Identified);
        assert!(distributor.registry().is_online(b"b"));

        let notices = drain(&mut a_rx);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].category, ProtocolCategory::Join);
        assert_eq!(&notices[0].from_key[..], b"b");

        // Joining again changes nothing and notifies nobody.
        let outcome = distributor.distribute(&b, TransportMessage::join("b", "g"));
        assert!(matches!(
            outcome,
            Distribution::Joined {
                changed: false,
                notified: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_join_rejects_foreign_key() {
        let distributor = distributor();
        let (a, _rx) = connect(&distributor, "a");
        let outcome = distributor.distribute(&a, TransportMessage::join("mallory", "g"));
        assert!(matches!(
            outcome,
            Distribution::Rejected(RouteError::Session(SessionError::KeyAlreadyBound(_)))
        ));
        assert!(distributor.registry().members(b"g").is_empty());
    }

    #[test]
    fn test_leave_group_and_sign_off() {
        let distributor = distributor();
        let (a, _a_rx) = connect(&distributor, "a");
        let (b, mut b_rx) = connect(&distributor, "b");
        distributor.distribute(&a, TransportMessage::join("a", "g"));
        distributor.distribute(&b, TransportMessage::join("b", "g"));
        drain(&mut b_rx);

        let outcome = distributor.distribute(&a, TransportMessage::leave("a", "g"));
        assert!(matches!(
            outcome,
            Distribution::Left {
                changed: true,
                notified: 1,
                ..
            }
        ));
        assert_eq!(drain(&mut b_rx)[0].category, ProtocolCategory::Leave);

        let outcome = distributor.distribute(&a, TransportMessage::leave("a", Bytes::new()));
        assert_eq!(outcome, Distribution::SignedOff);
        assert!(a.is_closed());
    }

    #[test]
    fn test_online_replaces_previous_session() {
        let distributor = distributor();
        let (first, _rx1) = connect(&distributor, "u1");
        let (second, _rx2) = ConnectionSession::new(SessionConfig::default(), None);

        let outcome = distributor.distribute(&second, TransportMessage::online("u1"));
        assert!(matches!(outcome, Distribution::Online { replaced: true, .. }));
        assert!(first.is_closed());
        assert_eq!(
            distributor.registry().resolve(b"u1").unwrap().id(),
            second.id()
        );
    }

    #[test]
    fn test_online_without_key_rejected() {
        let distributor = distributor();
        let (session, _rx) = ConnectionSession::new(SessionConfig::default(), None);
        let outcome = distributor.distribute(&session, TransportMessage::online(Bytes::new()));
        assert_eq!(
            outcome,
            Distribution::Rejected(RouteError::Session(SessionError::EmptyKey))
        );
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_online_notifies_co_members() {
        let distributor = distributor();
        let (a, mut a_rx) = connect(&distributor, "a");
        distributor.distribute(&a, TransportMessage::join("a", "g"));
        distributor
            .registry()
            .join(&Bytes::from_static(b"b"), &Bytes::from_static(b"g"));

        let (_b, _b_rx) = connect(&distributor, "b");
        let notices = drain(&mut a_rx);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].category, ProtocolCategory::Online);
    }

    #[test]
    fn test_disconnect_cleans_up() {
        let distributor = distributor();
        let (a, _a_rx) = connect(&distributor, "a");
        let (b, mut b_rx) = connect(&distributor, "b");
        distributor.distribute(&a, TransportMessage::join("a", "g"));
        distributor.distribute(&b, TransportMessage::join("b", "g"));
        distributor.distribute(&b, TransportMessage::one("b", "a", "hi"));
        drain(&mut b_rx);

        let report = distributor.disconnect(&a);

        assert_eq!(report.groups, 1);
        assert_eq!(report.released_acks, 1);
        assert_eq!(report.notified, 1);
        assert!(a.is_closed());
        assert!(distributor.registry().resolve(b"a").is_none());
        assert_eq!(
            distributor.registry().members(b"g"),
            HashSet::from([Bytes::from_static(b"b")])
        );
        assert_eq!(drain(&mut b_rx)[0].category, ProtocolCategory::Leave);

        // A second teardown is harmless.
        assert_eq!(distributor.disconnect(&a), DisconnectReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retries_then_drops() {
        let distributor = MessageDistributor::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(AckTable::new(AckConfig {
                timeout: Duration::from_secs(5),
                max_retries: 1,
            })),
            DistributorConfig::default(),
        );
        let (sender, _srx) = connect(&distributor, "u1");
        let (_receiver, mut rx) = connect(&distributor, "u2");
        distributor.distribute(&sender, TransportMessage::one("u1", "u2", "hi"));
        assert_eq!(drain(&mut rx).len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = distributor.sweep_acks(Instant::now());
        assert_eq!(report, SweepReport { retried: 1, dropped: 0 });
        assert_eq!(drain(&mut rx).len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = distributor.sweep_acks(Instant::now());
        assert_eq!(report, SweepReport { retried: 0, dropped: 1 });
        assert!(distributor.acks().is_empty());
    }
}
