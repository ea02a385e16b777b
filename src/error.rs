//! Error taxonomy shared by the executor, endpoints and example APIs.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = ApiError> = std::result::Result<T, E>;

/// Terminal failures surfaced to callers.
///
/// Transient conditions (timeouts, connection resets, 429/5xx responses) never
/// show up here directly: the executor retries them and only reports
/// [`ApiError::ConnectionFailed`] once the retry budget is spent.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport kept failing until the retry budget was exhausted.
    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// The caller's cancellation token fired before the request completed.
    #[error("request cancelled")]
    Cancelled,

    /// A handler rejected the response (non-success status, validation error, ...).
    #[error("API error {status}: {message}")]
    Domain { status: u16, message: String },

    /// Missing or malformed setup, e.g. an absent API key or an unresolved route placeholder.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The request could not be built from the supplied transport options.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// reqwest rejected the request before it reached the network.
    #[error("request error: {0}")]
    Request(#[source] reqwest::Error),
}

impl ApiError {
    pub fn domain(status: u16, message: impl Into<String>) -> Self {
        ApiError::Domain {
            status,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ApiError::Configuration(message.into())
    }

    /// Errors that reach callers are final; retrying is the executor's job.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Status code attached to a domain rejection, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Domain { status, .. } => Some(*status),
            _ => None,
        }
    }
}
