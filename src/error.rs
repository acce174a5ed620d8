//! Error types for the OCR server HTTP boundary

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type for request handlers
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors surfaced to HTTP clients.
///
/// OCR failures themselves never appear here: they travel in-band in the
/// response body. This type covers request validation and admission only.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("unsupported request method")]
    MethodNotAllowed,

    #[error("failed to parse JSON body: {0}")]
    MalformedJson(String),

    #[error("invalid base64 image data: {0}")]
    InvalidBase64(String),

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("exactly one of image_path or image_base64 must be provided")]
    MissingImage,

    #[error("server busy, try again later")]
    Busy,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MalformedJson(_) | Self::InvalidBase64(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedImage(_) | Self::MissingImage => StatusCode::NOT_ACCEPTABLE,
            Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::info!("task queue full, rejecting request");
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
