//! HTTP handlers for the Waiting Room service.
//!
//! Handlers only parse parameters and shape responses; queue semantics live in
//! [`crate::queue::QueueManager`].

pub mod queue;
pub mod waiting_room;

pub use queue::{allow_users, get_rank, is_allowed, register_user, touch};
pub use waiting_room::waiting_room;

use crate::errors::WrError;
use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, HeaderMap},
};
use serde::de::DeserializeOwned;

/// Queue used when the request names none.
pub const DEFAULT_QUEUE: &str = "default";

pub(crate) fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// Name of the cookie carrying the admission token for `queue`.
pub fn token_cookie_name(queue: &str) -> String {
    format!("user-queue-{queue}-token")
}

pub(crate) fn require_queue(queue: &str) -> Result<(), WrError> {
    if queue.is_empty() {
        return Err(WrError::BadRequest("queue name must not be empty".to_string()));
    }
    Ok(())
}

/// Value of the first cookie called `name` across all `Cookie` headers.
pub(crate) fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Query string extractor that rejects with the service's JSON error body.
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for QueryParams<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = WrError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(params) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| WrError::BadRequest(rejection.body_text()))?;
        Ok(QueryParams(params))
    }
}
