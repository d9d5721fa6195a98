//! # rmessage-core
//!
//! Sessions, presence and message routing for the rmessage server.
//!
//! - **Session** - per-connection state, outbound queues and idle timers
//! - **Registry** - key → session and group → members, shared by all connections
//! - **Ack** - pending delivery confirmations with timeout and retry
//! - **Distributor** - routes each decoded message by category
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Session    │────▶│ Distributor │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  AckTable   │
//!                     └─────────────┘
//! ```

pub mod ack;
pub mod distributor;
pub mod registry;
pub mod session;

pub use ack::{AckConfig, AckKey, AckKind, AckRecord, AckTable};
pub use distributor::{
    DisconnectReport, Distribution, DistributorConfig, FanoutReport, MemberStatus,
    MessageDistributor, RouteError, SweepReport,
};
pub use registry::{Key, RegistryStats, SessionRegistry};
pub use session::{
    ConnectionSession, DeliveryError, SessionConfig, SessionError, SessionId, SessionOutbound,
    SessionState,
};
