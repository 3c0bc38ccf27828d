use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const MISSING_CREDENTIAL_MESSAGE: &str = "Missing HF_TOKEN environment variable.";
pub const INVALID_BODY_MESSAGE: &str = "Invalid JSON body.";

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn missing_credential() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing_credential",
            MISSING_CREDENTIAL_MESSAGE,
        )
    }

    pub fn invalid_body() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_body", INVALID_BODY_MESSAGE)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = if self.message.trim().is_empty() {
            "Request failed."
        } else {
            self.message.as_str()
        };
        (self.status, axum::Json(ErrorBody { error: message })).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
