//! Server bootstrap and connection lifecycle.
//!
//! Resolves the configured transport, binds it (retrying transient failures),
//! and runs the accept loop, the acknowledgment sweeper and the admin HTTP
//! endpoint side by side.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use rmessage_core::{AckTable, MessageDistributor, SessionRegistry};
use rmessage_transport::{
    drive, Acceptor, AcceptorFactory, BindOptions, Listener, PendingSession, Transport,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Pause after an accept error that is not a per-connection failure.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Shared server state.
pub struct AppState {
    /// Presence and group registry.
    pub registry: Arc<SessionRegistry>,
    /// Pending delivery acknowledgments.
    pub acks: Arc<AckTable>,
    /// Message router.
    pub distributor: Arc<MessageDistributor>,
    /// Server configuration.
    pub config: Config,
    /// Sessions currently being driven.
    active: AtomicUsize,
    started: Instant,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let acks = Arc::new(AckTable::new(config.ack_config()));
        let distributor = Arc::new(MessageDistributor::new(
            registry.clone(),
            acks.clone(),
            config.distributor_config(),
        ));

        Self {
            registry,
            acks,
            distributor,
            config,
            active: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Number of sessions currently being driven.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Run the rmessage server until interrupted.
///
/// # Errors
///
/// Returns an error if the configuration names an unknown protocol or the
/// listener cannot be bound for a non-transient reason.
pub async fn run_server(config: Config) -> Result<()> {
    // Resolved once; an unknown protocol fails before anything is bound.
    let acceptor = AcceptorFactory::with_defaults()
        .resolve(&config.transport.protocol)
        .with_context(|| format!("Invalid transport.protocol {:?}", config.transport.protocol))?;
    let options = config.bind_options()?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(config.clone()));

    let transport = bind_with_retry(
        acceptor.as_ref(),
        &options,
        Duration::from_millis(config.transport.bind_retry_initial_ms),
        Duration::from_millis(config.transport.bind_retry_max_ms),
    )
    .await?;
    let listener = Listener::new(transport, config.session_config(), config.codec_config())
        .with_handshake_timeout(config.handshake_timeout());

    info!(
        "rmessage server listening on {} ({})",
        listener
            .local_addr()
            .map_or_else(|| options.addr.to_string(), |addr| addr.to_string()),
        listener.protocol()
    );

    tokio::spawn(sweep_acks(state.clone()));

    if config.admin.enabled {
        let addr = config.admin_addr()?;
        let admin = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint on {}", addr))?;
        info!("Admin endpoint listening on http://{}", addr);

        let app = admin_router(state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin, app).await {
                error!("Admin endpoint failed: {}", e);
            }
        });
    }

    serve(listener, state, shutdown_signal()).await
}

/// Bind `options` through `acceptor`, retrying transient failures
/// indefinitely with capped exponential backoff.
///
/// # Errors
///
/// Returns the first non-transient bind error.
pub async fn bind_with_retry(
    acceptor: &dyn Acceptor,
    options: &BindOptions,
    initial: Duration,
    max: Duration,
) -> Result<Box<dyn Transport>> {
    let mut delay = initial;
    let mut attempt = 1u32;

    loop {
        match acceptor.bind(options).await {
            Ok(transport) => return Ok(transport),
            Err(e) if e.is_transient() => {
                warn!(
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Bind on {} failed: {}",
                    options.addr,
                    e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max);
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to bind {} listener on {}", acceptor.protocol(), options.addr)
                })
            }
        }
    }
}

/// Accept connections until `shutdown` resolves.
///
/// Handshakes run on each connection's own task, so a stalled peer never
/// holds up the loop.
async fn serve(
    listener: Listener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            biased;

            () = &mut shutdown => {
                info!("Shutting down, {} sessions active", state.active_connections());
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(pending) => {
                if state.active_connections() >= state.config.limits.max_connections {
                    warn!(
                        remote = ?pending.remote_addr(),
                        limit = state.config.limits.max_connections,
                        "Connection limit reached, refusing session"
                    );
                    metrics::record_rejected_connection();
                    continue;
                }
                state.active.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_session(state.clone(), pending));
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Accept failed");
                metrics::record_error("accept");
            }
            Err(e) => {
                // Typically descriptor exhaustion; back off instead of spinning.
                warn!(error = %e, "Accept failed, pausing");
                metrics::record_error("accept");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Complete the handshake and drive one session to completion.
async fn handle_session(state: Arc<AppState>, pending: PendingSession) {
    let remote = pending.remote_addr();
    let established = match pending.establish().await {
        Ok(established) => established,
        Err(e) => {
            debug!(?remote, error = %e, "Handshake failed");
            metrics::record_error("handshake");
            state.active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let summary = drive(
        established,
        state.distributor.clone(),
        state.config.driver_config(),
        metrics::record_distribution,
    )
    .await;

    state.active.fetch_sub(1, Ordering::Relaxed);
    metrics::record_session_closed(summary.reason.label(), summary.messages);
    metrics::set_routing_state(&state.registry.stats(), state.acks.len());
}

/// Periodically re-deliver or drop unacknowledged messages.
async fn sweep_acks(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.ack_sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let now = interval.tick().await;
        let report = state.distributor.sweep_acks(now);
        if report.retried > 0 || report.dropped > 0 {
            debug!(retried = report.retried, dropped = report.dropped, "Ack sweep");
        }
        metrics::record_sweep(&report);
        metrics::set_routing_state(&state.registry.stats(), state.acks.len());
    }
}

/// Build the admin HTTP router.
fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Registry and acknowledgment counters.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "protocol": state.config.transport.protocol,
        "active_connections": state.active_connections(),
        "registry": state.registry.stats(),
        "pending_acks": state.acks.len(),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use rmessage_protocol::{encode, FrameCodec, TransportMessage};
    use rmessage_transport::TransportError;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    async fn start(config: Config) -> (Arc<AppState>, std::net::SocketAddr, oneshot::Sender<()>) {
        let acceptor = AcceptorFactory::with_defaults()
            .resolve(&config.transport.protocol)
            .unwrap();
        let listener = Listener::bind(
            acceptor.as_ref(),
            &BindOptions::new("127.0.0.1:0".parse().unwrap()),
            config.session_config(),
            config.codec_config(),
        )
        .await
        .unwrap()
        .with_handshake_timeout(config.handshake_timeout());
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(config));

        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, state.clone(), async move {
            let _ = stopped.await;
        }));
        (state, addr, stop)
    }

    async fn roundtrip(stream: &mut TcpStream, message: &TransportMessage) -> Option<TransportMessage> {
        // A refused session may reset the stream instead of closing it.
        if stream.write_all(&encode(message).unwrap()).await.is_err() {
            return None;
        }
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        loop {
            if let Some(reply) = codec.decode(&mut buf).unwrap() {
                return Some(reply);
            }
            match stream.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {}
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_sessions_served_and_counted() {
        let (state, addr, _stop) = start(Config::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&encode(&TransportMessage::online("u1")).unwrap())
            .await
            .unwrap();
        let pong = roundtrip(&mut client, &TransportMessage::ping()).await;
        assert_eq!(pong, Some(TransportMessage::pong()));

        let Json(stats) = stats_handler(State(state.clone())).await;
        assert_eq!(stats["active_connections"], 1);
        assert_eq!(stats["registry"]["online_keys"], 1);
        assert_eq!(stats["protocol"], "tcp");
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_extra_sessions() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (state, addr, _stop) = start(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert!(roundtrip(&mut first, &TransportMessage::ping()).await.is_some());

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert!(roundtrip(&mut second, &TransportMessage::ping()).await.is_none());
        assert_eq!(state.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_other_clients() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        let mut config = Config::default();
        config.transport.protocol = "websocket".to_string();
        config.transport.handshake_timeout_ms = 200;
        let (state, addr, _stop) = start(config).await;

        let _silent = TcpStream::connect(addr).await.unwrap();

        let served = tokio::time::timeout(Duration::from_secs(5), async move {
            let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
            ws.send(Message::Binary(encode(&TransportMessage::ping()).unwrap().to_vec()))
                .await
                .unwrap();
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => (ws, data),
                other => panic!("unexpected reply: {:?}", other),
            }
        })
        .await
        .expect("client stalled behind a silent peer");
        let (_ws, served) = served;
        assert_eq!(served, encode(&TransportMessage::pong()).unwrap().to_vec());

        // The silent peer is dropped once its handshake times out.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(state.active_connections(), 1);
    }

    struct FlakyAcceptor {
        failures: AtomicUsize,
        kind: io::ErrorKind,
    }

    #[async_trait]
    impl Acceptor for FlakyAcceptor {
        fn protocol(&self) -> &'static str {
            "flaky"
        }

        async fn bind(&self, options: &BindOptions) -> Result<Box<dyn Transport>, TransportError> {
            if self.failures.fetch_sub(1, Ordering::Relaxed) > 0 {
                return Err(TransportError::Bind {
                    addr: options.addr,
                    source: io::Error::from(self.kind),
                });
            }
            AcceptorFactory::with_defaults()
                .resolve("tcp")?
                .bind(options)
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_retries_transient_failures() {
        let acceptor = FlakyAcceptor {
            failures: AtomicUsize::new(3),
            kind: io::ErrorKind::AddrInUse,
        };
        let options = BindOptions::new("127.0.0.1:0".parse().unwrap());

        let transport = bind_with_retry(
            &acceptor,
            &options,
            Duration::from_millis(10),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_eq!(transport.name(), "tcp");
    }

    #[tokio::test]
    async fn test_bind_gives_up_on_terminal_failure() {
        let acceptor = FlakyAcceptor {
            failures: AtomicUsize::new(1),
            kind: io::ErrorKind::PermissionDenied,
        };
        let options = BindOptions::new("127.0.0.1:0".parse().unwrap());

        let err = bind_with_retry(
            &acceptor,
            &options,
            Duration::from_millis(10),
            Duration::from_millis(20),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("Failed to bind flaky listener"));
    }
}
