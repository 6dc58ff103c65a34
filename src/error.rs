use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Realm announced in authentication challenges when none is configured.
pub const DEFAULT_REALM: &str = "OPDS-ABS";

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing, malformed, rejected or expired credential.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Upstream unreachable, timed out or failing after retries.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Unknown library, item, series, author or collection.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed pagination or search parameters.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unreadable persisted cache snapshot.
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Challenge header value for a Basic realm.
pub fn basic_challenge(realm: &str) -> HeaderValue {
    let challenge = format!("Basic realm=\"{}\"", realm.replace('"', ""));
    HeaderValue::from_str(&challenge).unwrap_or_else(|_| HeaderValue::from_static("Basic"))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request error");
        } else {
            tracing::warn!(error = %self, "Request rejected");
        }

        let mut response = (status, self.to_string()).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, basic_challenge(DEFAULT_REALM));
        }
        response
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
