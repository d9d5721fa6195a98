//! Transport abstraction traits for rmessage.
//!
//! These traits define the interface every listener must provide, allowing
//! the server to stay independent of the stream protocol carrying frames.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to bind a listener.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] rmessage_protocol::ProtocolError),

    /// Stream handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No acceptor is registered for the protocol identifier.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Bind { source, .. } | TransportError::Io(source) => matches!(
                source.kind(),
                io::ErrorKind::AddrInUse
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
            ),
            TransportError::Handshake(_) => true,
            _ => false,
        }
    }
}

/// A bound listener that accepts connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method waits until a new connection is available or an error occurs.
    /// It never waits on the peer: protocol handshakes run later, in
    /// [`Connection::handshake`].
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Protocol identifier (e.g., "tcp", "websocket").
    fn name(&self) -> &'static str;

    /// Address the listener is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// An accepted bidirectional stream.
#[async_trait]
pub trait Connection: Send {
    /// Remote address of the connection, if known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Complete any protocol handshake. Raw streams are ready on accept.
    async fn handshake(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Split into independently owned read and write halves.
    ///
    /// Fails if the handshake has not completed.
    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait ConnectionReader: Send {
    /// Append received bytes to `buf`.
    ///
    /// Returns the number of bytes appended; `0` means the peer closed the
    /// stream.
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError>;
}

/// Write half of a connection.
#[async_trait]
pub trait ConnectionWriter: Send {
    /// Write one encoded chunk in full.
    async fn write_all(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the write direction.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failures_are_transient() {
        let err = TransportError::Bind {
            addr: "127.0.0.1:7000".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("127.0.0.1:7000"));

        let denied = TransportError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(!denied.is_transient());
    }

    #[test]
    fn test_configuration_errors_are_terminal() {
        assert!(!TransportError::UnsupportedProtocol("udp".into()).is_transient());
        assert!(!TransportError::ConnectionClosed.is_transient());
    }
}
