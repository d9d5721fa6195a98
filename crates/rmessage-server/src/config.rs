//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`rmessage.toml`, `/etc/rmessage/rmessage.toml`,
//!   `~/.config/rmessage/rmessage.toml`)
//! - Environment variables: `RMESSAGE__SECTION__FIELD` over any field,
//!   `RMESSAGE_HOST` / `RMESSAGE_PORT` for the default bind address

use anyhow::{Context, Result};
use rmessage_core::{AckConfig, DistributorConfig, SessionConfig};
use rmessage_protocol::CodecConfig;
use rmessage_transport::{BindOptions, DriverConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of layered environment overrides.
const ENV_PREFIX: &str = "RMESSAGE";

/// Default configuration file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "rmessage.toml",
    "/etc/rmessage/rmessage.toml",
    "~/.config/rmessage/rmessage.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Frame codec configuration.
    #[serde(default)]
    pub codec: CodecSection,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Delivery acknowledgment configuration.
    #[serde(default)]
    pub acks: AcksConfig,

    /// Routing behaviour.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admin HTTP endpoint configuration.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Protocol identifier (`tcp` or `websocket`).
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest single WebSocket message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// First delay between bind attempts in milliseconds.
    #[serde(default = "default_bind_retry_initial")]
    pub bind_retry_initial_ms: u64,

    /// Longest delay between bind attempts in milliseconds.
    #[serde(default = "default_bind_retry_max")]
    pub bind_retry_max_ms: u64,

    /// Time a peer gets to complete the protocol handshake, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound queue capacity per session.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Priority lane capacity per session.
    #[serde(default = "default_control_queue")]
    pub control_queue: usize,
}

/// Frame codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecSection {
    /// Maximum declared body length in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Append and verify a CRC-32 trailer on every frame.
    #[serde(default)]
    pub checksum: bool,

    /// Close the connection on a checksum mismatch instead of dropping the frame.
    #[serde(default)]
    pub close_on_checksum_error: bool,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping after this many milliseconds without outbound traffic.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close after this many milliseconds without inbound traffic.
    #[serde(default = "default_read_idle")]
    pub read_idle_ms: u64,

    /// Unanswered pings tolerated before closing.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

/// Delivery acknowledgment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcksConfig {
    /// Time to wait for each acknowledgment in milliseconds.
    #[serde(default = "default_ack_timeout")]
    pub timeout_ms: u64,

    /// Re-deliveries after the first attempt.
    #[serde(default = "default_ack_retries")]
    pub max_retries: u32,

    /// How often expired acknowledgments are swept, in milliseconds.
    #[serde(default = "default_ack_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Broadcast join/leave to the other members of the group.
    #[serde(default = "default_true")]
    pub broadcast_membership: bool,

    /// Broadcast online announcements to co-members.
    #[serde(default = "default_true")]
    pub broadcast_presence: bool,

    /// Relay acknowledgments to the original sender.
    #[serde(default = "default_true")]
    pub forward_acks: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Admin HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin port.
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

// Default value functions
fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_host() -> String {
    std::env::var("RMESSAGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RMESSAGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000)
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    2 * 1024 * 1024 // 2 MB
}

fn default_bind_retry_initial() -> u64 {
    100
}

fn default_bind_retry_max() -> u64 {
    30_000 // 30 seconds
}

fn default_handshake_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_max_connections() -> usize {
    100_000
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_control_queue() -> usize {
    16
}

fn default_max_body_size() -> usize {
    rmessage_protocol::codec::DEFAULT_MAX_BODY_SIZE
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_read_idle() -> u64 {
    90_000 // 90 seconds
}

fn default_max_missed() -> u32 {
    3
}

fn default_ack_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_ack_retries() -> u32 {
    2
}

fn default_ack_sweep_interval() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_admin_port() -> u16 {
    8081
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            bind_retry_initial_ms: default_bind_retry_initial(),
            bind_retry_max_ms: default_bind_retry_max(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            outbound_queue: default_outbound_queue(),
            control_queue: default_control_queue(),
        }
    }
}

impl Default for CodecSection {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            checksum: false,
            close_on_checksum_error: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            read_idle_ms: default_read_idle(),
            max_missed: default_max_missed(),
        }
    }
}

impl Default for AcksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ack_timeout(),
            max_retries: default_ack_retries(),
            sweep_interval_ms: default_ack_sweep_interval(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            broadcast_membership: true,
            broadcast_presence: true,
            forward_acks: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first default path that exists, with
    /// `RMESSAGE__*` environment overrides layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
            .find(|path| path.exists());

        Self::layered(path.as_deref())
    }

    /// Load `path` (if any) and layer `RMESSAGE__*` environment variables over it.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the result does not
    /// deserialize.
    pub fn layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }
        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        layered.try_deserialize().with_context(|| match path {
            Some(path) => format!("Failed to parse config file: {}", path.display()),
            None => "Failed to parse environment configuration".to_string(),
        })
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .transport
            .host
            .parse()
            .with_context(|| format!("Invalid host: {}", self.transport.host))?;
        Ok(SocketAddr::new(ip, self.transport.port))
    }

    /// Listener bind options.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn bind_options(&self) -> Result<BindOptions> {
        Ok(BindOptions {
            addr: self.bind_addr()?,
            max_message_size: self.transport.max_message_size,
        })
    }

    /// Admin endpoint address, on the transport host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is invalid.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_addr()?.ip(), self.admin.port))
    }

    /// Per-session queue sizes.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outbound_capacity: self.limits.outbound_queue,
            control_capacity: self.limits.control_queue,
        }
    }

    /// Frame codec settings.
    #[must_use]
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            max_body_size: self.codec.max_body_size,
            checksum: self.codec.checksum,
            close_on_checksum_error: self.codec.close_on_checksum_error,
        }
    }

    /// Idle and heartbeat settings for connection drivers.
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            read_idle: Duration::from_millis(self.heartbeat.read_idle_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            max_missed_heartbeats: self.heartbeat.max_missed,
        }
    }

    /// Acknowledgment table settings.
    #[must_use]
    pub fn ack_config(&self) -> AckConfig {
        AckConfig {
            timeout: Duration::from_millis(self.acks.timeout_ms),
            max_retries: self.acks.max_retries,
        }
    }

    /// Handshake deadline for accepted connections.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }

    /// Interval between acknowledgment sweeps.
    #[must_use]
    pub fn ack_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.acks.sweep_interval_ms.max(1))
    }

    /// Routing settings.
    #[must_use]
    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            broadcast_membership: self.routing.broadcast_membership,
            broadcast_presence: self.routing.broadcast_presence,
            forward_acks: self.routing.forward_acks,
        }
    }
}
