//! Error types for the tiered cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache and its HTTP surface.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key not found in either tier
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data (bad key, oversized entry, bad pattern)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Entry cannot fit in the memory budget even after eviction
    #[error("Cache full: {0}")]
    CacheFull(String),

    /// Compressing or decompressing a payload failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored payload could not be decoded on read
    #[error("Corrupted entry: {0}")]
    Corrupted(String),

    /// Durable tier rejected or failed an operation
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Durable tier did not answer within the configured timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::Serialization(_) => StatusCode::BAD_REQUEST,
            CacheError::CacheFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            CacheError::Persistence(_) => StatusCode::BAD_GATEWAY,
            CacheError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CacheError::Compression(_) | CacheError::Corrupted(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
