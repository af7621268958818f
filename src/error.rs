#[cfg(feature = "web")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::core::embeddings::ExtractionError;
use crate::core::store::StoreError;

/// Main error type for the application
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A required request field is missing or empty
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed upload
    #[error("Upload error: {0}")]
    UploadError(String),

    /// The image could not be turned into a feature vector
    #[error("Feature extraction failed")]
    Extraction(#[from] ExtractionError),

    /// The vector store failed
    #[error("Storage failure")]
    Store(#[from] StoreError),

    /// Internal server errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Standard error response format
#[derive(Serialize)]
#[derive(Debug)]
pub struct ErrorResponse {
    /// Error code (HTTP status code)
    pub code: u16,
    /// Error message
    pub message: String,
}

impl AppError {
    /// HTTP status code this error maps to
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Validation(_) => 400,
            Self::UploadError(_) => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }

    #[cfg(feature = "web")]
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Message safe to expose to callers; server-side details stay in the logs
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(msg)
            | Self::Validation(msg)
            | Self::UploadError(msg)
            | Self::NotFound(msg) => msg.clone(),
            Self::Extraction(_) => "feature extraction failed".to_string(),
            Self::Store(_) => "storage failure".to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// The error and all of its sources, outermost first
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            message.push_str(": ");
            message.push_str(&err.to_string());
            source = err.source();
        }
        message
    }

    /// Convert the error to a JSON response
    pub fn to_json(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.public_message(),
        }
    }
}

#[cfg(feature = "web")]
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("{}", self.chain());
        } else {
            log::debug!("Rejected request: {}", self);
        }

        (status, Json(self.to_json())).into_response()
    }
}

// Implement From for common error types
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(feature = "web")]
impl From<axum::extract::multipart::MultipartError> for AppError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        AppError::UploadError(err.body_text())
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;

/// Extension trait for working with Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static;

    /// Add context to an error if the result is an error
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|e| AppError::Internal(format!("{}: {}", context, e)))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| {
            let context = f();
            AppError::Internal(format!("{}: {}", context, e))
        })
    }
}
