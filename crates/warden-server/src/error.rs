use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.status.as_str().to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<governance::GatewayError> for AppError {
    fn from(err: governance::GatewayError) -> Self {
        match err {
            governance::GatewayError::Unauthorized(reason) => AppError::unauthorized(reason),
            governance::GatewayError::Internal(detail) => AppError::internal(detail),
        }
    }
}

impl From<control_plane::RepositoryError> for AppError {
    fn from(err: control_plane::RepositoryError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<control_plane::ConfigError> for AppError {
    fn from(err: control_plane::ConfigError) -> Self {
        AppError::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}
