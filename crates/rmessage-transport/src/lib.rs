//! # rmessage-transport
//!
//! Stream transports and connection plumbing for the rmessage server.
//!
//! - **TCP** - frames directly on the byte stream
//! - **WebSocket** - frames carried in binary WebSocket messages
//!
//! ## Transport Abstraction
//!
//! All listeners implement the `Transport` and `Connection` traits. The
//! `AcceptorFactory` resolves a configured protocol identifier to the acceptor
//! that binds it, and `drive` runs one accepted session to completion.
//!
//! ```rust,ignore
//! use rmessage_transport::{drive, AcceptorFactory, BindOptions, DriverConfig, Listener};
//!
//! let acceptor = AcceptorFactory::with_defaults().resolve("tcp")?;
//! let listener = Listener::bind(acceptor.as_ref(), &options, session_config, codec_config).await?;
//! loop {
//!     let pending = listener.accept().await?;
//!     let distributor = distributor.clone();
//!     tokio::spawn(async move {
//!         if let Ok(established) = pending.establish().await {
//!             drive(established, distributor, DriverConfig::default(), |_, _| {}).await;
//!         }
//!     });
//! }
//! ```

pub mod acceptor;
pub mod driver;
pub mod tcp;
pub mod traits;
pub mod websocket;

pub use acceptor::{
    establish, Acceptor, AcceptorFactory, BindOptions, EstablishedSession, Inbound, Listener,
    PendingSession, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use driver::{drive, CloseReason, DriveSummary, DriverConfig};
pub use tcp::TcpTransport;
pub use traits::{Connection, ConnectionReader, ConnectionWriter, Transport, TransportError};
pub use websocket::WebSocketTransport;
