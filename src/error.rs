use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;

/// Whether error bodies may carry internal details. Set once at startup from `APP_ENV`.
static EXPOSE_DETAILS: OnceLock<bool> = OnceLock::new();

/// Enable or disable internal details in error responses.
///
/// Only the first call has an effect; later calls are ignored.
pub fn set_expose_details(expose: bool) {
    let _ = EXPOSE_DETAILS.set(expose);
}

/// Details are shown unless the process was explicitly put in production mode.
pub fn expose_details() -> bool {
    *EXPOSE_DETAILS.get().unwrap_or(&true)
}

/// Stable machine-readable discriminator clients switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    OrganizationAccessDenied,
    DatabaseUnavailable,
    TimeoutError,
    RateLimitExceeded,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::OrganizationAccessDenied => "ORGANIZATION_ACCESS_DENIED",
            Self::DatabaseUnavailable => "DATABASE_UNAVAILABLE",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code for this error class
    pub fn status(self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::Unauthorized => 401,
            Self::OrganizationAccessDenied => 403,
            Self::RateLimitExceeded => 429,
            Self::InternalError => 500,
            Self::DatabaseUnavailable => 503,
            Self::TimeoutError => 504,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum DoraError {
    #[error("invalid `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("access denied: {0}")]
    OrganizationAccess(String),

    #[error("warehouse connection failed: {0}")]
    Connection(String),

    #[error("warehouse query failed: {0}")]
    Database(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type DoraResult<T> = Result<T, DoraError>;

impl DoraError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::OrganizationAccess(_) => ErrorCode::OrganizationAccessDenied,
            Self::Connection(_) | Self::Database(_) => ErrorCode::DatabaseUnavailable,
            Self::Timeout(_) => ErrorCode::TimeoutError,
            Self::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            Self::Config(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to show to any client.
    ///
    /// Warehouse and internal failures are summarized; the raw text only travels in `details`.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::Unauthorized(msg) | Self::OrganizationAccess(msg) => msg.clone(),
            Self::Connection(_) | Self::Database(_) => {
                "The metrics warehouse is currently unavailable".to_string()
            }
            Self::Timeout(_) => "The metrics query took too long to complete".to_string(),
            Self::RateLimited { .. } => "Too many requests, please try again later".to_string(),
            Self::Config(_) | Self::Internal(_) => "An unexpected error occurred".to_string(),
        }
    }

    /// Structured context for non-production error bodies
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::Validation { field, message } => {
                serde_json::json!({ "field": field, "reason": message })
            }
            Self::RateLimited { retry_after_secs } => {
                serde_json::json!({ "retry_after_secs": retry_after_secs })
            }
            other => serde_json::json!({ "cause": other.to_string() }),
        }
    }

    /// Whether this error invalidates the cached warehouse connection
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<reqwest::Error> for DoraError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Database(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DoraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Database(format!("malformed warehouse response: {err}"))
    }
}
