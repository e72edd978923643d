//! Waiting Room error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl. Store
//! failures are logged server-side and reach clients only as a generic
//! "service unavailable" message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Waiting Room error type.
///
/// Maps to HTTP status codes:
/// - `AlreadyRegistered`: 409 Conflict
/// - `BadRequest`: 400 Bad Request
/// - `StoreUnavailable`, `StoreTimeout`: 503 Service Unavailable
/// - `HashAlgorithmUnavailable`: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum WrError {
    /// User is already waiting in the queue.
    #[error("User {user_id} is already registered in queue {queue}")]
    AlreadyRegistered { queue: String, user_id: i64 },

    /// Store call failed (connection, protocol, script error).
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store call did not complete within the configured timeout.
    #[error("Store timeout: {0}")]
    StoreTimeout(String),

    /// SHA-256 self-test failed at startup.
    #[error("Hash algorithm unavailable: {0}")]
    HashAlgorithmUnavailable(String),

    /// Invalid caller input.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl WrError {
    /// Prefix a store failure with the operation that produced it.
    ///
    /// Non-store variants are returned unchanged.
    #[must_use]
    pub fn with_context(self, operation: &str) -> Self {
        match self {
            WrError::StoreUnavailable(msg) => {
                WrError::StoreUnavailable(format!("{operation}: {msg}"))
            }
            WrError::StoreTimeout(msg) => WrError::StoreTimeout(format!("{operation}: {msg}")),
            other => other,
        }
    }

    /// Returns true for failures of the backing store.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            WrError::StoreUnavailable(_) | WrError::StoreTimeout(_)
        )
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            WrError::AlreadyRegistered { .. } => 409,
            WrError::BadRequest(_) => 400,
            WrError::StoreUnavailable(_) | WrError::StoreTimeout(_) => 503,
            WrError::HashAlgorithmUnavailable(_) => 500,
        }
    }

    /// Returns the stable error code reported to clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            WrError::AlreadyRegistered { .. } => "QUEUE_ALREADY_REGISTERED_USER",
            WrError::BadRequest(_) => "BAD_REQUEST",
            WrError::StoreUnavailable(_) | WrError::StoreTimeout(_) => "SERVICE_UNAVAILABLE",
            WrError::HashAlgorithmUnavailable(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            WrError::AlreadyRegistered { .. } => "Already registered user.".to_string(),
            WrError::BadRequest(reason) => reason.clone(),
            WrError::StoreUnavailable(_) | WrError::StoreTimeout(_) => {
                "Service temporarily unavailable".to_string()
            }
            WrError::HashAlgorithmUnavailable(_) => "An internal error occurred".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for WrError {
    fn into_response(self) -> Response {
        if self.is_store_failure() {
            tracing::warn!(target: "wr.availability", error = %self, "Store failure surfaced to client");
        } else if self.status_code() >= 500 {
            tracing::error!(target: "wr.errors", error = %self, "Internal failure surfaced to client");
        }

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}
