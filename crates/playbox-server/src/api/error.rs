//! API error type shared by the handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failures surfaced as HTTP errors. User-visible run failures (timeout,
/// oversized output) are not errors: they ride the `error` field of a
/// 200 response. Operator detail is logged where the error is raised;
/// the body carries only generic text.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
    Unhealthy(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Unhealthy(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("health check failure: {msg}"),
            ),
        };
        (status, format!("{message}\n")).into_response()
    }
}
