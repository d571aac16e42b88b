//! Error taxonomy shared across every component of the ingestion core.
//!
//! Each variant corresponds to one of the error *kinds* named in the design:
//! validation failures are surfaced verbatim, auth/budget/rate errors carry
//! their own no-retry or retry-with-backoff policy, and `Internal` is an
//! invariant violation that should never be expected in normal operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// No valid token can currently be served: the last known tuple has
    /// truly expired and recovery mode has not yet obtained a replacement.
    /// Distinct from `AuthRejected`, which means a refresh attempt was
    /// actively turned down by the authorization server.
    #[error("no valid token currently available: {0}")]
    Unavailable(String),

    #[error("malformed response from upstream: {0}")]
    Malformed(String),

    #[error("daily API budget exhausted")]
    BudgetExhausted,

    #[error("rate limited by remote API: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether the failure is expected to resolve itself if retried later
    /// with backoff, per the retry policy in the error-handling design.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::RateLimited(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound(e.to_string()),
            other => CoreError::Transient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CoreError::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_client_error() {
                CoreError::AuthRejected(e.to_string())
            } else {
                CoreError::Transient(e.to_string())
            }
        } else {
            CoreError::Transient(e.to_string())
        }
    }
}
