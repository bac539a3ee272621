//! SFU Signaling Service
//!
//! WebSocket signaling server in front of a mediasoup media engine.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000, path `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (text or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Spawn the session registry and initialize the media engine
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start the signaling server
//! 7. Wait for a shutdown signal or engine death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use media_engine::mediasoup::MediasoupEngine;
use media_engine::FatalSignal;
use signaling_service::actors::{ActorMetrics, SessionRegistryHandle};
use signaling_service::config::{Config, LogFormat};
use signaling_service::context::ServiceContext;
use signaling_service::lifecycle::ConnectionManager;
use signaling_service::observability::{health_router, init_metrics_recorder, HealthState};
use signaling_service::server::{signaling_router, SignalingState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the registry actor gets to stop after shutdown.
const REGISTRY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it selects the log format.
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "signaling_service=debug,tower_http=debug".into()),
    );
    match config.log_format {
        LogFormat::Json => subscriber.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        listen_ip = %config.listen_ip,
        announced_address = ?config.announced_address,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        engine_call_timeout_ms = ?config.engine_call_timeout.map(|t| t.as_millis()),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let actor_metrics = ActorMetrics::new();
    let shutdown_token = CancellationToken::new();

    let (registry, registry_task) =
        SessionRegistryHandle::new(config.producer_tombstone_ttl, Arc::clone(&actor_metrics));

    let context = Arc::new(ServiceContext::new(
        Arc::new(MediasoupEngine::new()),
        registry.clone(),
        config.transport_options(),
        config.engine_call_timeout,
    ));

    // Engine death after this point is fatal for the process.
    let fatal = FatalSignal::new();
    info!("Initializing media engine...");
    context
        .initialize_engine(&config.engine_config(), fatal.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to initialize media engine");
            e
        })?;
    health_state.set_ready();

    let manager = ConnectionManager::new(
        Arc::clone(&context),
        Arc::clone(&actor_metrics),
        shutdown_token.child_token(),
    );

    // Health server: liveness/readiness probes and Prometheus /metrics
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(SignalingState {
        manager: Arc::clone(&manager),
        max_message_size: config.max_message_size,
    });

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    info!("SFU signaling service running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {}
        reason = fatal.tripped() => {
            error!(reason = %reason, "Media engine died, exiting");
            return Err(format!("media engine died: {reason}").into());
        }
    }

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    let closed = manager.shutdown().await;
    info!(closed_connections = closed, "Signaling connections closed");

    shutdown_token.cancel();
    registry.cancel();
    if tokio::time::timeout(REGISTRY_STOP_TIMEOUT, registry_task)
        .await
        .is_err()
    {
        warn!("Session registry did not stop in time");
    }

    info!("SFU signaling service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
