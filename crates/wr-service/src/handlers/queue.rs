//! Queue API handlers.
//!
//! - `POST /api/v1/queue` - Register a user in the wait set
//! - `POST /api/v1/queue/allow` - Promote users to proceed
//! - `GET /api/v1/queue/allowed` - Verify an admission token
//! - `GET /api/v1/queue/rank` - Current wait position
//! - `GET /api/v1/queue/touch` - Issue the admission token and its cookie
//!
//! Every endpoint accepts `queue` as a query parameter, defaulting to `default`.

use crate::errors::WrError;
use crate::handlers::{default_queue, require_queue, token_cookie_name, QueryParams};
use crate::observability::metrics;
use crate::routes::AppState;
use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    #[serde(default = "default_queue")]
    pub queue: String,
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankResponse {
    pub rank: i64,
}

#[derive(Debug, Deserialize)]
pub struct AllowParams {
    #[serde(default = "default_queue")]
    pub queue: String,
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowResponse {
    pub requested_count: i64,
    pub allowed_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct AllowedParams {
    #[serde(default = "default_queue")]
    pub queue: String,
    pub user_id: i64,
    pub flight_id: i64,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowedResponse {
    pub allowed: bool,
}

#[derive(Debug, Deserialize)]
pub struct TouchParams {
    #[serde(default = "default_queue")]
    pub queue: String,
    pub user_id: i64,
    pub flight_id: i64,
}

/// Handler for POST /api/v1/queue
///
/// # Response
///
/// - 200 OK: `{"rank": n}`
/// - 409 Conflict: user already waiting
#[instrument(skip_all, fields(queue = %params.queue, user_id = params.user_id))]
pub async fn register_user(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<RegisterParams>,
) -> Result<Json<RankResponse>, WrError> {
    let rank = state
        .manager
        .register(&params.queue, params.user_id)
        .await?
        .into_rank(&params.queue, params.user_id)?;
    Ok(Json(RankResponse { rank }))
}

/// Handler for POST /api/v1/queue/allow
#[instrument(skip_all, fields(queue = %params.queue, count = params.count))]
pub async fn allow_users(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<AllowParams>,
) -> Result<Json<AllowResponse>, WrError> {
    let allowed_count = state.manager.promote(&params.queue, params.count).await?;
    metrics::record_promoted("api", allowed_count);
    Ok(Json(AllowResponse {
        requested_count: params.count,
        allowed_count,
    }))
}

/// Handler for GET /api/v1/queue/allowed
#[instrument(skip_all, fields(queue = %params.queue, user_id = params.user_id))]
pub async fn is_allowed(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<AllowedParams>,
) -> Result<Json<AllowedResponse>, WrError> {
    require_queue(&params.queue)?;
    let allowed = state.manager.verify_token(
        &params.queue,
        params.user_id,
        params.flight_id,
        &params.token,
    );
    Ok(Json(AllowedResponse { allowed }))
}

/// Handler for GET /api/v1/queue/rank
///
/// Returns `{"rank": -1}` for users not waiting.
#[instrument(skip_all, fields(queue = %params.queue, user_id = params.user_id))]
pub async fn get_rank(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<RegisterParams>,
) -> Result<Json<RankResponse>, WrError> {
    let rank = state.manager.rank(&params.queue, params.user_id).await?;
    Ok(Json(RankResponse { rank }))
}

/// Handler for GET /api/v1/queue/touch
///
/// Returns the token as the body and sets `user-queue-<queue>-token`.
#[instrument(skip_all, fields(queue = %params.queue, user_id = params.user_id))]
pub async fn touch(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<TouchParams>,
) -> Result<Response, WrError> {
    require_queue(&params.queue)?;

    let token = state
        .tokens
        .get_or_create(&params.queue, params.user_id, params.flight_id);

    let cookie = format!(
        "{}={token}; Max-Age={}; Path=/",
        token_cookie_name(&params.queue),
        state.cookie_max_age_seconds
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|_| WrError::BadRequest("queue name is not valid in a cookie".to_string()))?;

    Ok(([(header::SET_COOKIE, cookie)], token).into_response())
}
