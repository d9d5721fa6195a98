//! # rmessage-protocol
//!
//! Wire protocol definitions for the rmessage routing server.
//!
//! This crate defines the binary framing used between rmessage clients and
//! servers: the message categories, the decoded message type, and a
//! resumable codec.
//!
//! ## Categories
//!
//! - `Online` - Announce a client key
//! - `One` / `Group` - Direct and fan-out messages
//! - `OneAck` / `GroupAck` / `Accept` - Delivery acknowledgments
//! - `Join` / `Leave` - Group membership
//! - `Ping` / `Pong` - Heartbeats
//!
//! ## Example
//!
//! ```rust
//! use rmessage_protocol::{codec, TransportMessage};
//!
//! let message = TransportMessage::one("u1", "u2", b"hi".to_vec());
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod category;
pub mod codec;
pub mod message;
pub mod version;

pub use category::ProtocolCategory;
pub use codec::{decode, encode, CodecConfig, FrameCodec, ProtocolError};
pub use message::{now_millis, TransportMessage};
pub use version::PROTOCOL_MARKER;
