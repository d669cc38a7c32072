//! Error types for Roost
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Application-wide error type
///
/// This enum represents all possible errors that can occur
/// in the application. It implements `IntoResponse` to
/// automatically convert errors to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Remote username does not resolve (404)
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Cache-only query referenced a never-fetched relation (409)
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error (500)
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote API rejected or garbled a request (502)
    #[error("Remote API error: {0}")]
    Remote(String),

    /// Remote rate limit (429); carries the remote reset time
    #[error("Rate limit exceeded, resets at {resets_at}")]
    RateLimited { resets_at: DateTime<Utc> },

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A job or query referenced state that cannot exist (500)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Serialization error (500)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<crate::twitter::FetchError> for AppError {
    fn from(err: crate::twitter::FetchError) -> Self {
        use crate::twitter::FetchError;
        match err {
            FetchError::RateLimited { resets_at } => AppError::RateLimited { resets_at },
            FetchError::NotFound => AppError::NotFound,
            FetchError::Remote(msg) => AppError::Remote(msg),
            FetchError::Http(err) => AppError::HttpClient(err),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::UnknownUser(_) => (StatusCode::NOT_FOUND, self.to_string(), "unknown_user"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::CacheUnavailable(msg) => {
                (StatusCode::CONFLICT, msg.clone(), "cache_unavailable")
            }
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                self.to_string(),
                "rate_limited",
            ),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Remote(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "remote"),
            AppError::Database(_) | AppError::Migrate(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::InvariantViolation(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                msg.clone(),
                "invariant_violation",
            ),
            AppError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Serialization error".to_string(),
                "serialization",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
