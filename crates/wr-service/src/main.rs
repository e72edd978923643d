//! Waiting Room Service
//!
//! Arrival-ordered admission control backed by Redis sorted sets.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Self-test SHA-256 and build the token issuer (fatal on failure)
//! 4. Connect to Redis and start the store check
//! 5. Start the admission scheduler
//! 6. Start the HTTP server (API, health, metrics)
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use secrecy::ExposeSecret;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wr_service::config::Config;
use wr_service::observability::{
    health_router, init_metrics_recorder, check_store, spawn_store_check, HealthState,
    STORE_CHECK_INTERVAL,
};
use wr_service::queue::QueueManager;
use wr_service::redis::RedisQueueStore;
use wr_service::routes::{build_routes, AppState};
use wr_service::scheduler::AdmissionScheduler;
use wr_service::token::{BoundedTokenCache, TokenIssuer};

/// Upper bound on how long shutdown waits for the scheduler to finish its sweep.
const SCHEDULER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wr_service=info,wr=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Waiting Room service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        http_bind_address = %config.http_bind_address,
        scheduler_enabled = config.scheduler_enabled,
        scheduler_batch_size = config.scheduler_batch_size,
        scheduler_interval_ms = config.scheduler_interval_ms,
        store_timeout_ms = config.store_timeout_ms,
        atomic_promotion = config.atomic_promotion,
        token_cache_capacity = config.token_cache_capacity,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to initialize metrics");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // A broken digest is fatal: refuse to start rather than issue bad tokens
    let tokens = TokenIssuer::new(Arc::new(BoundedTokenCache::new(
        config.token_cache_capacity,
    )))
    .map_err(|e| {
        error!(error = %e, "Token issuer self-test failed");
        e
    })?;
    let tokens = Arc::new(tokens);

    info!("Connecting to Redis...");
    let store = RedisQueueStore::new(config.redis_url.expose_secret(), config.store_timeout())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;

    let manager = Arc::new(QueueManager::new(
        Arc::new(store),
        Arc::clone(&tokens),
        config.queue_manager_config(),
    ));

    manager.ping().await.map_err(|e| {
        error!(error = %e, "Redis did not answer PING");
        e
    })?;
    info!("Redis connection established");

    let shutdown_token = CancellationToken::new();

    // Initial check marks the store reachable; later checks track outages
    check_store(&manager, &health_state).await;
    let store_check_handle = spawn_store_check(
        Arc::clone(&manager),
        Arc::clone(&health_state),
        STORE_CHECK_INTERVAL,
        shutdown_token.child_token(),
    );

    // Start admission scheduler (logs and skips every tick when disabled)
    let scheduler = AdmissionScheduler::new(
        Arc::clone(&manager),
        config.scheduler_config(),
        shutdown_token.child_token(),
    );
    let scheduler_handle = scheduler.start();
    info!(
        enabled = config.scheduler_enabled,
        "Admission scheduler started"
    );

    // HTTP server: API + health + metrics
    let http_addr: SocketAddr = config.http_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.http_bind_address, "Invalid HTTP bind address");
        format!("Invalid HTTP bind address: {e}")
    })?;

    let app_state = Arc::new(AppState::new(
        Arc::clone(&manager),
        config.token_cookie_max_age_seconds,
    ));

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = build_routes(app_state)
        .merge(health_router(Arc::clone(&health_state)))
        .merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %http_addr, "Failed to bind HTTP server");
            format!("Failed to bind HTTP server to {http_addr}: {e}")
        })?;
    info!(addr = %http_addr, "HTTP server bound successfully");

    let http_shutdown_token = shutdown_token.child_token();
    let http_handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            http_shutdown_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("Waiting Room service running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.start_draining();

    scheduler.stop();
    shutdown_token.cancel();

    match tokio::time::timeout(SCHEDULER_SHUTDOWN_TIMEOUT, scheduler_handle).await {
        Ok(Ok(())) => info!("Admission scheduler stopped"),
        Ok(Err(e)) => warn!(error = %e, "Admission scheduler task failed"),
        Err(_) => warn!("Admission scheduler did not stop in time"),
    }

    if let Err(e) = http_handle.await {
        warn!(error = %e, "HTTP server task failed");
    }

    if let Err(e) = store_check_handle.await {
        warn!(error = %e, "Store check task failed");
    }

    info!("Waiting Room service shutdown complete");
    Ok(())
}

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
