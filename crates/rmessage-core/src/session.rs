//! Per-connection session state.
//!
//! A [`ConnectionSession`] is the server-side handle for one client stream.
//! It owns the outbound queues feeding the stream's writer task, tracks read
//! and write activity for idle detection, and carries the cancellation token
//! that tears the stream down exactly once.

use bytes::Bytes;
use rmessage_protocol::TransportMessage;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Unique identifier for a session within this process.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Default outbound queue capacity per session.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default capacity of the priority control lane.
pub const DEFAULT_CONTROL_CAPACITY: usize = 16;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Stream accepted, no key bound yet.
    Connected = 0,
    /// A key has been bound.
    Identified = 1,
    /// Disposed. Terminal.
    Closed = 2,
}

impl From<u8> for SessionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionState::Connected,
            1 => SessionState::Identified,
            _ => SessionState::Closed,
        }
    }
}

/// Delivery failures when queueing a message on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The session has been disposed.
    #[error("Session closed")]
    Closed,

    /// The outbound queue is full; the message was dropped.
    #[error("Outbound queue full")]
    QueueFull,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is already bound to another key.
    #[error("Session already bound to key {0:?}")]
    KeyAlreadyBound(Bytes),

    /// An identifying message carried no key.
    #[error("Empty key")]
    EmptyKey,

    /// The session has been disposed.
    #[error("Session closed")]
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Capacity of the outbound message queue.
    pub outbound_capacity: usize,
    /// Capacity of the priority control lane.
    pub control_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
        }
    }
}

/// Receiving ends of a session's outbound queues, held by the writer task.
#[derive(Debug)]
pub struct SessionOutbound {
    control: mpsc::Receiver<TransportMessage>,
    messages: mpsc::Receiver<TransportMessage>,
}

impl SessionOutbound {
    /// Receive the next message to write.
    ///
    /// Control messages (heartbeats) always go out before queued traffic.
    pub async fn recv(&mut self) -> Option<TransportMessage> {
        tokio::select! {
            biased;

            Some(message) = self.control.recv() => Some(message),
            Some(message) = self.messages.recv() => Some(message),
            else => None,
        }
    }

    /// Take the next message without waiting, control lane first.
    pub fn try_recv(&mut self) -> Option<TransportMessage> {
        self.control
            .try_recv()
            .or_else(|_| self.messages.try_recv())
            .ok()
    }
}

/// A client connection as seen by the router.
pub struct ConnectionSession {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    key: OnceLock<Bytes>,
    state: AtomicU8,
    outbound: mpsc::Sender<TransportMessage>,
    control: mpsc::Sender<TransportMessage>,
    cancel: CancellationToken,
    created_at: Instant,
    /// Nanoseconds after `created_at` of the last inbound bytes.
    last_read: AtomicU64,
    /// Nanoseconds after `created_at` of the last outbound bytes.
    last_write: AtomicU64,
    missed_heartbeats: AtomicU32,
    dropped_messages: AtomicU64,
}

impl ConnectionSession {
    /// Create a new session and the receiving side of its outbound queues.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, SessionOutbound) {
        let (outbound, messages) = mpsc::channel(config.outbound_capacity.max(1));
        let (control, control_rx) = mpsc::channel(config.control_capacity.max(1));

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            key: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connected as u8),
            outbound,
            control,
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            missed_heartbeats: AtomicU32::new(0),
            dropped_messages: AtomicU64::new(0),
        });

        debug!(session = session.id, remote = ?remote_addr, "Session created");

        let receivers = SessionOutbound {
            control: control_rx,
            messages,
        };
        (session, receivers)
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the underlying stream, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The key bound to this session, if identified.
    #[must_use]
    pub fn key(&self) -> Option<&Bytes> {
        self.key.get()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the session has been disposed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Token cancelled when the session is disposed.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the session is disposed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Bind an identifying key.
    ///
    /// Binding the key the session already carries is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or bound to a different key.
    pub fn bind_key(&self, key: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if key.is_empty() {
            return Err(SessionError::EmptyKey);
        }

        if let Err(rejected) = self.key.set(key) {
            return match self.key.get() {
                Some(bound) if *bound == rejected => Ok(()),
                Some(bound) => Err(SessionError::KeyAlreadyBound(bound.clone())),
                None => Err(SessionError::Closed),
            };
        }

        let _ = self.state.compare_exchange(
            SessionState::Connected as u8,
            SessionState::Identified as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(session = self.id, key = ?self.key.get(), "Session identified");
        Ok(())
    }

    /// Queue a message for this session's stream.
    ///
    /// Never waits: a full queue drops the message.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::QueueFull`] on overflow and
    /// [`DeliveryError::Closed`] after disposal.
    pub fn deliver(&self, message: TransportMessage) -> Result<(), DeliveryError> {
        self.enqueue(&self.outbound, message)
    }

    /// Queue a message on the priority lane, ahead of pending traffic.
    ///
    /// # Errors
    ///
    /// Same as [`deliver`](Self::deliver).
    pub fn deliver_urgent(&self, message: TransportMessage) -> Result<(), DeliveryError> {
        self.enqueue(&self.control, message)
    }

    fn enqueue(
        &self,
        queue: &mpsc::Sender<TransportMessage>,
        message: TransportMessage,
    ) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        match queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session = self.id,
                    category = %message.category,
                    "Outbound queue full, dropping message"
                );
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Total messages dropped on overflow.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    fn elapsed_nanos(&self) -> u64 {
        self.created_at.elapsed().as_nanos() as u64
    }

    /// Record inbound activity.
    pub fn touch_read(&self) {
        self.last_read.store(self.elapsed_nanos(), Ordering::Relaxed);
    }

    /// Record outbound activity.
    pub fn touch_write(&self) {
        self.last_write.store(self.elapsed_nanos(), Ordering::Relaxed);
    }

    /// Instant of the last inbound bytes (or creation).
    #[must_use]
    pub fn last_read(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_read.load(Ordering::Relaxed))
    }

    /// Instant of the last outbound bytes (or creation).
    #[must_use]
    pub fn last_write(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_write.load(Ordering::Relaxed))
    }

    /// Record a heartbeat ping sent without reply; returns the new miss count.
    pub fn record_missed_heartbeat(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset the missed-heartbeat counter (pong received).
    pub fn reset_heartbeat(&self) {
        self.missed_heartbeats.store(0, Ordering::Relaxed);
    }

    /// Heartbeats sent since the last pong.
    #[must_use]
    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::Relaxed)
    }

    /// Run `callback` whenever no bytes have been read for `idle`.
    ///
    /// The timer re-arms after firing and stops when the session is disposed.
    pub fn on_read_idle<F>(self: &Arc<Self>, idle: Duration, callback: F) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.watch_idle("read", idle, ConnectionSession::last_read, callback)
    }

    /// Run `callback` whenever no bytes have been written for `idle`.
    ///
    /// The timer re-arms after firing and stops when the session is disposed.
    pub fn on_write_idle<F>(self: &Arc<Self>, idle: Duration, callback: F) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.watch_idle("write", idle, ConnectionSession::last_write, callback)
    }

    fn watch_idle<F>(
        self: &Arc<Self>,
        direction: &'static str,
        idle: Duration,
        activity: fn(&ConnectionSession) -> Instant,
        mut callback: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        let session = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let id = self.id;
        let mut deadline = activity(self) + idle;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep_until(deadline) => {
                        let Some(session) = session.upgrade() else { break };
                        let due = activity(&session) + idle;
                        drop(session);

                        let now = Instant::now();
                        if now >= due {
                            trace!(session = id, direction, "Idle timeout fired");
                            callback();
                            deadline = now + idle;
                        } else {
                            deadline = due;
                        }
                    }
                }
            }
        })
    }

    /// Dispose the session, closing its stream.
    ///
    /// Returns `true` for the call that performed the disposal; every other
    /// call, concurrent or later, is a no-op returning `false`.
    pub fn dispose(&self) -> bool {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return false;
        }
        self.cancel.cancel();
        debug!(session = self.id, key = ?self.key.get(), "Session disposed");
        true
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("key", &self.key.get())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn make_session() -> (Arc<ConnectionSession>, SessionOutbound) {
        ConnectionSession::new(SessionConfig::default(), None)
    }

    #[test]
    fn test_session_lifecycle() {
        let (session, _rx) = make_session();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.key().is_none());

        session.bind_key(Bytes::from_static(b"u1")).unwrap();
        assert_eq!(session.state(), SessionState::Identified);
        assert_eq!(session.key().unwrap(), &Bytes::from_static(b"u1"));

        // Same key again is fine, a different one is not.
        session.bind_key(Bytes::from_static(b"u1")).unwrap();
        assert!(matches!(
            session.bind_key(Bytes::from_static(b"u2")),
            Err(SessionError::KeyAlreadyBound(_))
        ));

        assert!(session.dispose());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.cancellation().is_cancelled());
        assert_eq!(
            session.bind_key(Bytes::from_static(b"u1")),
            Err(SessionError::Closed)
        );
    }

    #[test]
    fn test_unique_session_ids() {
        let (a, _ra) = make_session();
        let (b, _rb) = make_session();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_concurrent_dispose_runs_once() {
        let (session, _rx) = make_session();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.dispose())
            })
            .collect();

        let disposals = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|disposed| *disposed)
            .count();
        assert_eq!(disposals, 1);
        assert!(!session.dispose());
    }

    #[test]
    fn test_deliver_overflow_drops() {
        let (session, mut rx) = ConnectionSession::new(
            SessionConfig {
                outbound_capacity: 2,
                control_capacity: 1,
            },
            None,
        );

        session.deliver(TransportMessage::one("a", "b", "1")).unwrap();
        session.deliver(TransportMessage::one("a", "b", "2")).unwrap();
        assert_eq!(
            session.deliver(TransportMessage::one("a", "b", "3")),
            Err(DeliveryError::QueueFull)
        );
        assert_eq!(session.dropped_messages(), 1);

        assert_eq!(&rx.try_recv().unwrap().body[..], b"1");
        assert_eq!(&rx.try_recv().unwrap().body[..], b"2");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_deliver_after_dispose() {
        let (session, _rx) = make_session();
        session.dispose();
        assert_eq!(
            session.deliver(TransportMessage::ping()),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_control_lane_goes_first() {
        let (session, mut rx) = make_session();
        session.deliver(TransportMessage::one("a", "b", "queued")).unwrap();
        session.deliver_urgent(TransportMessage::pong()).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, TransportMessage::pong());
        let second = rx.recv().await.unwrap();
        assert_eq!(&second.body[..], b"queued");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_idle_fires() {
        let (session, _rx) = make_session();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        session.on_read_idle(Duration::from_secs(5), move || flag.store(true, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_activity_postpones_idle() {
        let (session, _rx) = make_session();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        session.on_read_idle(Duration::from_secs(5), move || flag.store(true, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(3)).await;
        session.touch_read();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_idle_timer() {
        let (session, _rx) = make_session();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle =
            session.on_write_idle(Duration::from_secs(1), move || flag.store(true, Ordering::SeqCst));

        session.dispose();
        handle.await.unwrap();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_heartbeat_counter() {
        let (session, _rx) = make_session();
        assert_eq!(session.record_missed_heartbeat(), 1);
        assert_eq!(session.record_missed_heartbeat(), 2);
        session.reset_heartbeat();
        assert_eq!(session.missed_heartbeats(), 0);
    }
}
