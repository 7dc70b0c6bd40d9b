//! HTTP-facing error type.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::state::ConnectionLimitError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Server at capacity. Please try again later.")]
    AtCapacity,

    #[error("Too many connections from your IP address.")]
    TooManyConnections,

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::AtCapacity => "at_capacity",
            AppError::TooManyConnections => "too_many_connections",
            AppError::NotFound(_) => "not_found",
        }
    }
}

impl From<ConnectionLimitError> for AppError {
    fn from(err: ConnectionLimitError) -> Self {
        match err {
            ConnectionLimitError::GlobalLimitReached => AppError::AtCapacity,
            ConnectionLimitError::PerIpLimitReached => AppError::TooManyConnections,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_limit_mapping() {
        let global: AppError = ConnectionLimitError::GlobalLimitReached.into();
        assert_eq!(global.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(global.code(), "at_capacity");

        let per_ip: AppError = ConnectionLimitError::PerIpLimitReached.into();
        assert_eq!(per_ip.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_into_response_status() {
        let response = AppError::NotFound("/nope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
