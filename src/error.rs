//! Error types for aegisvm.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the aegisvm [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// API error codes surfaced on the HTTP control plane, per the error-kind
/// table: each kind maps to one HTTP status below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    NotFound,
    Disabled,
    Stopped,
    Starting,
    BackendUnsupported,
    Capability,
    Transport,
    Conflict,
    InternalError,
}

/// Structured API error response body, e.g.
/// `{"code":"NOT_FOUND","message":"...","retryable":false}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    fn new(code: ApiErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self { code, message: message.into(), retryable, retry_after_secs: None }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NotFound, message, false)
    }

    pub fn disabled(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Disabled, message, false)
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Stopped, message, false)
    }

    pub fn starting(message: impl Into<String>, retry_after_secs: u64) -> Self {
        let mut e = Self::new(ApiErrorCode::Starting, message, true);
        e.retry_after_secs = Some(retry_after_secs);
        e
    }

    pub fn backend_unsupported(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::BackendUnsupported, message, false)
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Capability, message, false)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Transport, message, true)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Conflict, message, false)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InternalError, message, true)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"code":"INTERNAL_ERROR","message":"serialization failed","retryable":true}"#
                .to_string()
        })
    }

    /// HTTP status code this kind is documented to surface as.
    pub fn status_code(&self) -> u16 {
        match self.code {
            ApiErrorCode::NotFound => 404,
            ApiErrorCode::Disabled => 503,
            ApiErrorCode::Stopped => 409,
            ApiErrorCode::Starting => 503,
            ApiErrorCode::BackendUnsupported => 400,
            ApiErrorCode::Capability => 400,
            ApiErrorCode::Transport => 502,
            ApiErrorCode::Conflict => 409,
            ApiErrorCode::InternalError => 500,
        }
    }
}

/// Errors that can occur in aegisvm operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance is disabled")]
    Disabled,

    #[error("instance is stopped")]
    Stopped,

    #[error("instance is still starting")]
    Starting,

    #[error("backend does not support this operation: {0}")]
    BackendUnsupported(String),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] aegisvm_protocol::ProtocolError),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        self.api_error().status_code()
    }

    /// Project this error onto the HTTP-facing [`ApiError`] envelope.
    pub fn api_error(&self) -> ApiError {
        match self {
            Error::NotFound(id) => ApiError::not_found(format!("no such instance: {id}")),
            Error::Disabled => ApiError::disabled("instance is disabled"),
            Error::Stopped => ApiError::stopped("instance is stopped"),
            Error::Starting => ApiError::starting("instance is starting", 3),
            Error::BackendUnsupported(m) => ApiError::backend_unsupported(m.clone()),
            Error::Capability(m) => ApiError::capability(m.clone()),
            Error::Transport(m) => ApiError::transport(m.clone()),
            Error::Conflict(m) => ApiError::conflict(m.clone()),
            Error::Backend(m) => ApiError::internal(m.clone()),
            Error::Config(m) => ApiError::internal(m.clone()),
            Error::Io(e) => ApiError::internal(e.to_string()),
            Error::Timeout(m) => ApiError::transport(m.clone()),
            Error::Serde(e) => ApiError::internal(e.to_string()),
            Error::Protocol(e) => ApiError::transport(e.to_string()),
            Error::Registry(m) => ApiError::internal(m.clone()),
            Error::Internal(m) => ApiError::internal(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_table() {
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Disabled.status_code(), 503);
        assert_eq!(Error::Stopped.status_code(), 409);
        assert_eq!(Error::Starting.status_code(), 503);
        assert_eq!(Error::BackendUnsupported("x".into()).status_code(), 400);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
    }

    #[test]
    fn starting_is_retryable_with_retry_after() {
        let api = Error::Starting.api_error();
        assert!(api.retryable);
        assert_eq!(api.retry_after_secs, Some(3));
    }
}
