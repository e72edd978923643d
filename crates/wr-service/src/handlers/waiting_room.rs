//! Waiting-room page flow.
//!
//! `GET /waiting-room` redirects users holding a valid admission cookie and
//! otherwise registers them, returning the data the waiting page renders.

use crate::errors::WrError;
use crate::handlers::{default_queue, read_cookie, require_queue, token_cookie_name, QueryParams};
use crate::queue::Registration;
use crate::routes::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
pub struct WaitingRoomParams {
    #[serde(default = "default_queue")]
    pub queue: String,
    pub user_id: i64,
    pub flight_id: i64,
    pub redirect_url: String,
}

/// Data rendered by the waiting page.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitingRoomView {
    /// Current wait position.
    pub number: i64,
    pub user_id: i64,
    pub queue: String,
}

/// Handler for GET /waiting-room
///
/// # Response
///
/// - 303 See Other to `redirect_url`: cookie token is valid
/// - 200 OK with [`WaitingRoomView`]: user registered, or already waiting
#[instrument(skip_all, fields(queue = %params.queue, user_id = params.user_id))]
pub async fn waiting_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    QueryParams(params): QueryParams<WaitingRoomParams>,
) -> Result<Response, WrError> {
    require_queue(&params.queue)?;
    let presented = read_cookie(&headers, &token_cookie_name(&params.queue)).unwrap_or_default();

    if state
        .manager
        .verify_token(&params.queue, params.user_id, params.flight_id, &presented)
    {
        debug!(
            target: "wr.handlers.waiting_room",
            queue = %params.queue,
            user_id = params.user_id,
            "Admission token accepted, redirecting"
        );
        return Ok(Redirect::to(&params.redirect_url).into_response());
    }

    let number = match state.manager.register(&params.queue, params.user_id).await? {
        Registration::Registered { rank } => rank,
        // Already in line: show the current position instead
        Registration::AlreadyRegistered => {
            state.manager.rank(&params.queue, params.user_id).await?
        }
    };

    Ok(Json(WaitingRoomView {
        number,
        user_id: params.user_id,
        queue: params.queue,
    })
    .into_response())
}
