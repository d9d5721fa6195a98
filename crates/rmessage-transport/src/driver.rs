//! Per-connection driver.
//!
//! Runs the read side of an [`EstablishedSession`]: arms the idle and
//! heartbeat timers, feeds every decoded message to the distributor in
//! arrival order, and tears the session down when the stream ends.

use rmessage_core::{ConnectionSession, DisconnectReport, Distribution, MessageDistributor};
use rmessage_protocol::TransportMessage;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::acceptor::EstablishedSession;
use crate::traits::TransportError;

/// Default time without inbound bytes before a session is closed.
pub const DEFAULT_READ_IDLE: Duration = Duration::from_secs(90);

/// Default time without outbound bytes before a heartbeat ping is sent.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default unanswered pings tolerated before a session is closed.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Driver configuration.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Close the session after this long without inbound bytes.
    pub read_idle: Duration,
    /// Send a ping after this long without outbound bytes.
    pub heartbeat_interval: Duration,
    /// Unanswered pings tolerated before closing.
    pub max_missed_heartbeats: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            read_idle: DEFAULT_READ_IDLE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

/// Why a driven session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed the stream.
    PeerClosed,
    /// The session was disposed (sign-off, replacement, idle or heartbeat).
    Disposed,
    /// The stream failed or carried an unrecoverable frame.
    Error(TransportError),
}

impl CloseReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Disposed => "disposed",
            CloseReason::Error(TransportError::Protocol(_)) => "protocol_error",
            CloseReason::Error(_) => "transport_error",
        }
    }
}

/// Outcome of driving one session to completion.
#[derive(Debug)]
pub struct DriveSummary {
    /// Messages decoded and distributed.
    pub messages: u64,
    /// Why the session ended.
    pub reason: CloseReason,
    /// Cleanup performed on teardown.
    pub disconnect: DisconnectReport,
}

/// Drive `established` until its stream ends, then disconnect it.
///
/// `observe` sees every message with the outcome of distributing it.
pub async fn drive<F>(
    established: EstablishedSession,
    distributor: Arc<MessageDistributor>,
    config: DriverConfig,
    mut observe: F,
) -> DriveSummary
where
    F: FnMut(&TransportMessage, &Distribution) + Send,
{
    let EstablishedSession {
        session,
        mut inbound,
        writer,
    } = established;

    arm_timers(&session, config);

    let mut messages = 0u64;
    let reason = loop {
        match inbound.next().await {
            Some(Ok(message)) => {
                messages += 1;
                let outcome = distributor.distribute(&session, message.clone());
                observe(&message, &outcome);
                if let Distribution::Rejected(err) = &outcome {
                    debug!(session = session.id(), error = %err, "Message rejected");
                }
            }
            Some(Err(e)) => {
                warn!(session = session.id(), error = %e, "Closing session");
                break CloseReason::Error(e);
            }
            None if session.is_closed() => break CloseReason::Disposed,
            None => break CloseReason::PeerClosed,
        }
    };

    let disconnect = distributor.disconnect(&session);
    if let Err(e) = writer.await {
        warn!(session = session.id(), error = %e, "Writer task failed");
    }

    info!(
        session = session.id(),
        key = ?session.key(),
        messages,
        reason = reason.label(),
        "Session closed"
    );

    DriveSummary {
        messages,
        reason,
        disconnect,
    }
}

/// Read idle closes the session; write idle sends a heartbeat ping, and the
/// session is closed once too many pings go unanswered.
fn arm_timers(session: &Arc<ConnectionSession>, config: DriverConfig) {
    let weak: Weak<ConnectionSession> = Arc::downgrade(session);
    session.on_read_idle(config.read_idle, move || {
        if let Some(session) = weak.upgrade() {
            debug!(session = session.id(), "Read idle, disposing session");
            session.dispose();
        }
    });

    let weak = Arc::downgrade(session);
    let max_missed = config.max_missed_heartbeats;
    session.on_write_idle(config.heartbeat_interval, move || {
        let Some(session) = weak.upgrade() else { return };
        let missed = session.record_missed_heartbeat();
        if missed > max_missed {
            debug!(session = session.id(), missed, "Heartbeat lost, disposing session");
            session.dispose();
        } else if session.deliver_urgent(TransportMessage::ping()).is_err() {
            session.dispose();
        }
    });
}
