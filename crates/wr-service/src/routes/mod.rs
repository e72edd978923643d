//! HTTP routes for the Waiting Room service.
//!
//! Defines the Axum router and application state.

use crate::handlers;
use crate::queue::QueueManager;
use crate::token::TokenIssuer;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout applied to every route.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Queue operations.
    pub manager: Arc<QueueManager>,

    /// Admission token issuer (shared with `manager`).
    pub tokens: Arc<TokenIssuer>,

    /// Max-Age of the admission token cookie.
    pub cookie_max_age_seconds: u64,
}

impl AppState {
    pub fn new(manager: Arc<QueueManager>, cookie_max_age_seconds: u64) -> Self {
        let tokens = manager.tokens();
        Self {
            manager,
            tokens,
            cookie_max_age_seconds,
        }
    }
}

/// Build the application routes.
///
/// - `POST /api/v1/queue` - Register
/// - `POST /api/v1/queue/allow` - Promote
/// - `GET /api/v1/queue/allowed` - Verify token
/// - `GET /api/v1/queue/rank` - Wait position
/// - `GET /api/v1/queue/touch` - Issue token cookie
/// - `GET /waiting-room` - Redirect or register
///
/// Health and metrics endpoints are merged in by `main`.
pub fn build_routes(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/queue", post(handlers::register_user))
        .route("/api/v1/queue/allow", post(handlers::allow_users))
        .route("/api/v1/queue/allowed", get(handlers::is_allowed))
        .route("/api/v1/queue/rank", get(handlers::get_rank))
        .route("/api/v1/queue/touch", get(handlers::touch))
        .route("/waiting-room", get(handlers::waiting_room))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    api_routes
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}
