use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Typed failures surfaced to callers. Storage-level errors are logged and
/// collapsed to a generic 500 so connection strings and SQL never leak.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PolicyViolation(String),

    #[error("access window has expired; progress was reset, restart the course")]
    AccessExpired,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflicting concurrent update: {0}")]
    ConcurrencyConflict(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            Error::PolicyViolation(_) => (StatusCode::CONFLICT, "policy_violation"),
            Error::AccessExpired => (StatusCode::FORBIDDEN, "access_expired"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::ConcurrencyConflict(_) => (StatusCode::CONFLICT, "concurrency_conflict"),
            Error::Storage(e) => {
                tracing::error!(error=%e, "storage failure");
                let body = json!({ "error": "internal", "reason": "internal error" });
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
        };
        let body = json!({ "error": code, "reason": self.to_string() });
        (status, Json(body)).into_response()
    }
}
