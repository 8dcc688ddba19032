//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::fmt::Display;

use crate::api::types::{ApiErrorResponse, Status};
use crate::error::Error;

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found (404).
    NotFound(String),
    /// Conflict - resource already exists or invalid state (409).
    Conflict(String),
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// Request timeout (408).
    Timeout,
    /// Server-side failure (500) with its taxonomy code.
    Internal {
        /// Error code, e.g. `NETWORK_ERROR`.
        code: &'static str,
        /// Error message.
        message: String,
    },
}

impl ApiError {
    /// Convert any displayable error to an internal API error.
    pub fn internal(err: impl Display) -> Self {
        Self::Internal {
            code: "INTERNAL_ERROR",
            message: err.to_string(),
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (code, message) = match self {
            ApiError::NotFound(msg) => ("NOT_FOUND", msg),
            ApiError::Conflict(msg) => ("CONFLICT", msg),
            ApiError::BadRequest(msg) => ("BAD_REQUEST", msg),
            ApiError::Timeout => ("TIMEOUT", "request timed out".to_string()),
            ApiError::Internal { code, message } => (code, message),
        };

        let body = Json(ApiErrorResponse {
            status: Status::Failed,
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::VmNotFound { .. } => ApiError::NotFound(message),
            Error::VmAlreadyExists { .. } | Error::InvalidState { .. } | Error::Busy { .. } => {
                ApiError::Conflict(message)
            }
            Error::InvalidRequest { .. } => ApiError::BadRequest(message),
            other => ApiError::Internal {
                code: other.code(),
                message,
            },
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::internal(format!("task failed: {}", err))
    }
}
