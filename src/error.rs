//! Error types for speedbump.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for speedbump operations.
#[derive(Error, Debug)]
pub enum SpeedbumpError {
    /// A key extractor could not derive an identity from the request.
    #[error("Key resolution failed: {0}")]
    KeyResolution(String),

    /// The counter store could not be read.
    #[error("Counter store read failed: {0}")]
    StoreRead(String),

    /// The counter store could not be updated.
    #[error("Counter store write failed: {0}")]
    StoreWrite(String),

    /// The external counter backend could not be set up.
    #[error("Counter backend unavailable: {0}")]
    BackendConstruction(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpeedbumpError {
    /// HTTP status a governed request receives when this error ends it.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SpeedbumpError::KeyResolution(_) => StatusCode::PRECONDITION_REQUIRED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SpeedbumpError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Result type alias for speedbump operations.
pub type Result<T> = std::result::Result<T, SpeedbumpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_resolution_maps_to_precondition_required() {
        let err = SpeedbumpError::KeyResolution("no remote address".to_string());
        assert_eq!(err.status_code(), StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(err.into_response().status(), StatusCode::PRECONDITION_REQUIRED);
    }

    #[test]
    fn test_store_errors_map_to_server_error() {
        let read = SpeedbumpError::StoreRead("timeout".to_string());
        let write = SpeedbumpError::StoreWrite("timeout".to_string());
        assert_eq!(read.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(write.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
