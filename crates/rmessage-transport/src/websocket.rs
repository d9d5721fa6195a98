//! WebSocket transport implementation.
//!
//! Frames travel as binary WebSocket messages using tokio-tungstenite. A
//! WebSocket message boundary carries no meaning: payloads are appended to
//! the session's byte stream and framed by the codec like any other stream.
//!
//! `accept` only takes the TCP stream; the upgrade runs in
//! [`Connection::handshake`] on the connection's own task.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Error as WsError, Message},
    WebSocketStream,
};
use std::mem;
use tracing::{debug, info, warn};

use crate::traits::{Connection, ConnectionReader, ConnectionWriter, Transport, TransportError};

/// Default maximum WebSocket message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    max_message_size: usize,
}

impl WebSocketTransport {
    /// Bind a WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if binding to the address fails.
    pub async fn bind(addr: SocketAddr, max_message_size: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(
            "WebSocket transport listening on {}",
            listener.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            listener,
            max_message_size,
        })
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;

        debug!("Accepted TCP connection from {}", addr);

        Ok(Box::new(WebSocketConnection {
            state: HandshakeState::Pending(stream),
            addr,
            config: self.ws_config(),
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    state: HandshakeState,
    addr: SocketAddr,
    config: WebSocketConfig,
}

enum HandshakeState {
    Pending(TcpStream),
    Open(WebSocketStream<TcpStream>),
    Failed,
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        let stream = match mem::replace(&mut self.state, HandshakeState::Failed) {
            HandshakeState::Pending(stream) => stream,
            HandshakeState::Open(stream) => {
                self.state = HandshakeState::Open(stream);
                return Ok(());
            }
            HandshakeState::Failed => {
                return Err(TransportError::Handshake("handshake already failed".into()))
            }
        };

        let ws_stream = accept_async_with_config(stream, Some(self.config))
            .await
            .map_err(|e| {
                warn!("WebSocket handshake with {} failed: {}", self.addr, e);
                TransportError::Handshake(e.to_string())
            })?;

        debug!("WebSocket handshake completed with {}", self.addr);
        self.state = HandshakeState::Open(ws_stream);
        Ok(())
    }

    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>), TransportError> {
        let HandshakeState::Open(ws_stream) = self.state else {
            return Err(TransportError::Handshake(format!(
                "{} has not completed the handshake",
                self.addr
            )));
        };

        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(WebSocketReader { stream }),
            Box::new(WebSocketWriter { sink }),
        ))
    }
}

struct WebSocketReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl ConnectionReader for WebSocketReader {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    buf.extend_from_slice(&data);
                    return Ok(data.len());
                }
                Some(Ok(Message::Text(text))) => {
                    // Treated as binary.
                    if text.is_empty() {
                        continue;
                    }
                    buf.extend_from_slice(text.as_bytes());
                    return Ok(text.len());
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(0);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(0);
                }
                Some(Err(WsError::Io(e))) => return Err(TransportError::Io(e)),
                Some(Err(e)) => return Err(TransportError::Other(e.to_string())),
            }
        }
    }
}

struct WebSocketWriter {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl ConnectionWriter for WebSocketWriter {
    async fn write_all(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                WsError::Io(e) => TransportError::Io(e),
                e => TransportError::Other(e.to_string()),
            })
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }
}
