//! Error types for idemgate

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for idemgate
pub type Result<T> = std::result::Result<T, Error>;

/// Idemgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed idempotency key
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Request body exceeds the configured cap
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured maximum body size in bytes
        limit: usize,
    },

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error surfaces as.
    ///
    /// Policy outcomes (conflict, in-progress, wait timeout) are not errors;
    /// they are [`crate::engine::Outcome`] variants and carry their own
    /// status mapping in the middleware.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidKey(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error code for JSON error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidKey(_) => "invalid_idempotency_key",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Store(_) => "store_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Internal(_) => "internal_error",
        }
    }
}
