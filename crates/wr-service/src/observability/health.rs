//! Health endpoints.
//!
//! - `GET /health` - Liveness: the process is serving HTTP
//! - `GET /ready` - Readiness: the store answered its last ping and the
//!   service is not draining
//!
//! Store reachability is refreshed by [`spawn_store_check`], so a Redis
//! outage takes the instance out of rotation until the store answers again.
//! The `/metrics` endpoint is served separately via `metrics-exporter-prometheus`.

use crate::queue::QueueManager;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default cadence of the store reachability check.
pub const STORE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Readiness inputs.
#[derive(Debug, Default)]
pub struct HealthState {
    store_reachable: AtomicBool,
    draining: AtomicBool,
}

impl HealthState {
    /// Not ready until the store has been reached once.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of the latest store ping. Returns the previous value.
    pub fn set_store_reachable(&self, reachable: bool) -> bool {
        self.store_reachable.swap(reachable, Ordering::SeqCst)
    }

    /// Stop accepting traffic for the rest of the process lifetime.
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.store_reachable.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }
}

/// Ping the store once and record the result.
pub async fn check_store(manager: &QueueManager, state: &HealthState) -> bool {
    let reachable = manager.ping().await.is_ok();
    let previous = state.set_store_reachable(reachable);

    match (previous, reachable) {
        (true, false) => warn!(
            target: "wr.health",
            "Store unreachable, reporting not ready"
        ),
        (false, true) => info!(target: "wr.health", "Store reachable, reporting ready"),
        _ => debug!(target: "wr.health", reachable = reachable, "Store check"),
    }
    reachable
}

/// Spawn the periodic store check. Exits when `cancel_token` fires.
pub fn spawn_store_check(
    manager: Arc<QueueManager>,
    state: Arc<HealthState>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    check_store(&manager, &state).await;
                }
                () = cancel_token.cancelled() => {
                    debug!(target: "wr.health", "Store check stopped");
                    break;
                }
            }
        }
    })
}

/// Router with `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
