//! HTTP error types.
//!
//! Maps domain errors from `tokend-core` into HTTP responses. Every variant
//! produces a JSON body with a machine-readable `error` field and a fixed,
//! minimal `message` — never the underlying component error's text, which is
//! logged instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use tokend_core::{ActivityError, DatabaseError, RepositoryError, SigningKeyError, TokenError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Generic bearer-auth failure. Always renders as "unauthorized" —
    /// token faults must never leak their specific reason to the client.
    Unauthorized,
    /// HMAC-path failure with a fixed, specific message
    /// (`"Missing signature header"`, `"Invalid signature"`).
    UnauthorizedWithReason(&'static str),
    Forbidden(&'static str),
    NotFound,
    BadRequest(String),
    Internal,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized".to_owned()),
            Self::UnauthorizedWithReason(reason) => (StatusCode::UNAUTHORIZED, "unauthorized", reason.to_owned()),
            Self::Forbidden(reason) => (StatusCode::FORBIDDEN, "forbidden", reason.to_owned()),
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found", "not found".to_owned()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal server error".to_owned(),
            ),
        };

        (status, axum::Json(ErrorBody { error: error_type, message })).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        tracing::warn!(component = "auth", action = "verify_token", error = %err, "token verification failed");
        match err {
            TokenError::Database(_) | TokenError::SigningKey(SigningKeyError::Database(_)) => Self::Internal,
            _ => Self::Unauthorized,
        }
    }
}

impl From<SigningKeyError> for AppError {
    fn from(err: SigningKeyError) -> Self {
        tracing::error!(component = "signing_key", error = %err, "signing key operation failed");
        Self::Internal
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        tracing::error!(component = "database", error = %err, "database operation failed");
        Self::Internal
    }
}

impl From<ActivityError> for AppError {
    fn from(err: ActivityError) -> Self {
        tracing::error!(component = "activity", error = %err, "activity operation failed");
        Self::Internal
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => Self::NotFound,
            RepositoryError::Database(inner) => inner.into(),
        }
    }
}
