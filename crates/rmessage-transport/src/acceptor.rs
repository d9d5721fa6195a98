//! Protocol acceptors and established sessions.
//!
//! An [`AcceptorFactory`] maps a protocol identifier to the [`Acceptor`] able
//! to bind it. The server resolves its configured protocol once at startup;
//! the bound [`Listener`] hands out [`PendingSession`]s without waiting on the
//! peer. Each one completes its handshake on its own task and becomes a
//! [`ConnectionSession`] with a writer task and a decoding [`Inbound`] half.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{self, Stream};
use rmessage_core::{ConnectionSession, SessionConfig, SessionOutbound};
use rmessage_protocol::{CodecConfig, FrameCodec, TransportMessage};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::tcp::TcpTransport;
use crate::traits::{Connection, ConnectionReader, ConnectionWriter, Transport, TransportError};
use crate::websocket::{WebSocketTransport, DEFAULT_MAX_MESSAGE_SIZE};

/// Initial read buffer capacity per connection.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Default time a peer gets to complete the protocol handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to bind a listener.
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// Address to bind to.
    pub addr: SocketAddr,
    /// Largest single transport message, for message-oriented protocols.
    pub max_message_size: usize,
}

impl BindOptions {
    /// Options for `addr` with default limits.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Binds listeners for one protocol.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Protocol identifier this acceptor serves.
    fn protocol(&self) -> &'static str;

    /// Bind a transport listener.
    async fn bind(&self, options: &BindOptions) -> Result<Box<dyn Transport>, TransportError>;
}

/// Produces the acceptor for a protocol.
pub type AcceptorFn = fn() -> Arc<dyn Acceptor>;

/// Table of protocol identifier → acceptor constructor.
#[derive(Clone, Default)]
pub struct AcceptorFactory {
    acceptors: HashMap<String, AcceptorFn>,
}

impl AcceptorFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in `tcp` and `websocket` acceptors.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("tcp", || Arc::new(TcpAcceptor));
        factory.register("websocket", || Arc::new(WebSocketAcceptor));
        factory
    }

    /// Register `constructor` for `protocol`, replacing any previous entry.
    pub fn register(&mut self, protocol: impl Into<String>, constructor: AcceptorFn) -> &mut Self {
        self.acceptors.insert(protocol.into(), constructor);
        self
    }

    /// Registered protocol identifiers, sorted.
    #[must_use]
    pub fn protocols(&self) -> Vec<&str> {
        let mut protocols: Vec<&str> = self.acceptors.keys().map(String::as_str).collect();
        protocols.sort_unstable();
        protocols
    }

    /// Resolve the acceptor for `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedProtocol`] for unknown identifiers.
    pub fn resolve(&self, protocol: &str) -> Result<Arc<dyn Acceptor>, TransportError> {
        self.acceptors
            .get(protocol)
            .map(|constructor| constructor())
            .ok_or_else(|| TransportError::UnsupportedProtocol(protocol.to_string()))
    }
}

impl fmt::Debug for AcceptorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorFactory")
            .field("protocols", &self.protocols())
            .finish()
    }
}

struct TcpAcceptor;

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    async fn bind(&self, options: &BindOptions) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(TcpTransport::bind(options.addr).await?))
    }
}

struct WebSocketAcceptor;

#[async_trait]
impl Acceptor for WebSocketAcceptor {
    fn protocol(&self) -> &'static str {
        "websocket"
    }

    async fn bind(&self, options: &BindOptions) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(
            WebSocketTransport::bind(options.addr, options.max_message_size).await?,
        ))
    }
}

/// A bound listener producing pending sessions.
pub struct Listener {
    transport: Box<dyn Transport>,
    session_config: SessionConfig,
    codec_config: CodecConfig,
    handshake_timeout: Duration,
}

impl Listener {
    /// Wrap a bound transport.
    #[must_use]
    pub fn new(
        transport: Box<dyn Transport>,
        session_config: SessionConfig,
        codec_config: CodecConfig,
    ) -> Self {
        Self {
            transport,
            session_config,
            codec_config,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set how long a peer may take to complete its handshake.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Resolve-and-bind in one step.
    ///
    /// # Errors
    ///
    /// Returns the acceptor's bind error.
    pub async fn bind(
        acceptor: &dyn Acceptor,
        options: &BindOptions,
        session_config: SessionConfig,
        codec_config: CodecConfig,
    ) -> Result<Self, TransportError> {
        let transport = acceptor.bind(options).await?;
        Ok(Self::new(transport, session_config, codec_config))
    }

    /// Protocol identifier of the underlying transport.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.transport.name()
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Accept the next connection.
    ///
    /// Returns as soon as the transport hands over a stream; the handshake is
    /// left to [`PendingSession::establish`].
    ///
    /// # Errors
    ///
    /// Returns the transport's accept error.
    pub async fn accept(&self) -> Result<PendingSession, TransportError> {
        let connection = self.transport.accept().await?;
        Ok(PendingSession {
            connection,
            protocol: self.protocol(),
            session_config: self.session_config,
            codec_config: self.codec_config,
            handshake_timeout: self.handshake_timeout,
        })
    }

    /// Stream of accepted connections.
    pub fn incoming(self) -> impl Stream<Item = Result<PendingSession, TransportError>> {
        stream::unfold(self, |listener| async move {
            let next = listener.accept().await;
            Some((next, listener))
        })
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("protocol", &self.protocol())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// An accepted connection that has not completed its handshake.
pub struct PendingSession {
    connection: Box<dyn Connection>,
    protocol: &'static str,
    session_config: SessionConfig,
    codec_config: CodecConfig,
    handshake_timeout: Duration,
}

impl PendingSession {
    /// Remote address of the connection, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.remote_addr()
    }

    /// Complete the handshake and set up the session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] if the peer fails the handshake
    /// or does not finish it within the handshake timeout.
    pub async fn establish(mut self) -> Result<EstablishedSession, TransportError> {
        let remote = self.connection.remote_addr();
        match tokio::time::timeout(self.handshake_timeout, self.connection.handshake()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(?remote, protocol = self.protocol, "Handshake timed out");
                return Err(TransportError::Handshake(format!(
                    "timed out after {:?}",
                    self.handshake_timeout
                )));
            }
        }

        let established = establish(self.connection, self.session_config, &self.codec_config)?;
        debug!(
            session = established.session.id(),
            ?remote,
            protocol = self.protocol,
            "Session established"
        );
        Ok(established)
    }
}

impl fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSession")
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

/// A connection wrapped in a live session.
///
/// Outbound messages go through [`ConnectionSession::deliver`]; the writer
/// task encodes and writes them until the session is disposed.
pub struct EstablishedSession {
    /// Session handle.
    pub session: Arc<ConnectionSession>,
    /// Decoded inbound messages.
    pub inbound: Inbound,
    /// Writer task.
    pub writer: JoinHandle<()>,
}

/// Wrap a connection whose handshake has completed in a session.
///
/// Spawns the writer task; the caller drives the returned inbound half.
///
/// # Errors
///
/// Returns the connection's error if it cannot be split.
pub fn establish(
    connection: Box<dyn Connection>,
    session_config: SessionConfig,
    codec_config: &CodecConfig,
) -> Result<EstablishedSession, TransportError> {
    let remote_addr = connection.remote_addr();
    let (reader, writer) = connection.split()?;

    let (session, outbound) = ConnectionSession::new(session_config, remote_addr);
    let writer = tokio::spawn(write_loop(
        session.clone(),
        outbound,
        writer,
        FrameCodec::new(*codec_config),
    ));

    let inbound = Inbound {
        session: session.clone(),
        reader,
        codec: FrameCodec::new(*codec_config),
        buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
    };

    Ok(EstablishedSession {
        session,
        inbound,
        writer,
    })
}

/// Inbound half of a session: reads bytes and decodes messages lazily.
pub struct Inbound {
    session: Arc<ConnectionSession>,
    reader: Box<dyn ConnectionReader>,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl Inbound {
    /// Next decoded message.
    ///
    /// Returns `None` when the peer closed the stream or the session was
    /// disposed. Frames failing a non-fatal check are skipped; a fatal
    /// decoding error is returned and ends the stream.
    pub async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {}
                Err(e) if !self.codec.is_fatal(&e) => {
                    warn!(session = self.session.id(), error = %e, "Dropping corrupt frame");
                    continue;
                }
                Err(e) => return Some(Err(e.into())),
            }

            let cancel = self.session.cancellation().clone();
            let read = tokio::select! {
                biased;

                () = cancel.cancelled() => return None,
                read = self.reader.read_buf(&mut self.buffer) => read,
            };

            match read {
                Ok(0) => {
                    trace!(session = self.session.id(), "Peer closed stream");
                    return None;
                }
                Ok(_) => self.session.touch_read(),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Session this stream belongs to.
    #[must_use]
    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }
}

async fn write_loop(
    session: Arc<ConnectionSession>,
    mut outbound: SessionOutbound,
    mut writer: Box<dyn ConnectionWriter>,
    codec: FrameCodec,
) {
    let cancel = session.cancellation().clone();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    loop {
        let message = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = codec.encode(&message, &mut buf) {
            warn!(
                session = session.id(),
                category = %message.category,
                error = %e,
                "Failed to encode outbound message"
            );
            continue;
        }

        let write = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            write = writer.write_all(buf.split().freeze()) => write,
        };
        if let Err(e) = write {
            debug!(session = session.id(), error = %e, "Write failed, disposing session");
            session.dispose();
            break;
        }
        session.touch_write();
    }

    if let Err(e) = writer.shutdown().await {
        trace!(session = session.id(), error = %e, "Shutdown after close failed");
    }
}
