//! Plain TCP transport.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::traits::{Connection, ConnectionReader, ConnectionWriter, Transport, TransportError};

/// TCP transport: frames travel directly on the byte stream.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if binding to the address fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(
            "TCP transport listening on {}",
            listener.local_addr().unwrap_or(addr)
        );

        Ok(Self { listener })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        debug!("Accepted TCP connection from {}", addr);
        Ok(Box::new(TcpConnection { stream, addr }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// An accepted TCP stream.
pub struct TcpConnection {
    stream: TcpStream,
    addr: SocketAddr,
}

#[async_trait]
impl Connection for TcpConnection {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>), TransportError> {
        let (read, write) = self.stream.into_split();
        Ok((Box::new(TcpReader(read)), Box::new(TcpWriter(write))))
    }
}

struct TcpReader(OwnedReadHalf);

#[async_trait]
impl ConnectionReader for TcpReader {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        Ok(self.0.read_buf(buf).await?)
    }
}

struct TcpWriter(OwnedWriteHalf);

#[async_trait]
impl ConnectionWriter for TcpWriter {
    async fn write_all(&mut self, data: Bytes) -> Result<(), TransportError> {
        Ok(self.0.write_all(&data).await?)
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        Ok(self.0.shutdown().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_bytes_flow_both_ways() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let mut connection = transport.accept().await.unwrap();
        assert!(connection.remote_addr().is_some());
        connection.handshake().await.unwrap();
        let (mut reader, mut writer) = connection.split().unwrap();

        let mut buf = BytesMut::new();
        while buf.len() < 4 {
            assert!(reader.read_buf(&mut buf).await.unwrap() > 0);
        }
        assert_eq!(&buf[..], b"ping");

        writer.write_all(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(&client.await.unwrap(), b"pong");

        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_reported_as_bind_error() {
        let first = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = TcpTransport::bind(addr).await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
        assert!(err.is_transient());
    }
}
