//! Retry decisions for transient failures.
//!
//! Two kinds of failure are retried:
//! - retryable statuses (429 and the 5xx gateway family), delayed by the
//!   server's `Retry-After` header when present, else by the base delay;
//! - transport failures, delayed by exponential backoff `base * 2^attempt`.

use std::time::Duration;

use reqwest::StatusCode;

use crate::config::ClientConfig;

/// Statuses that are retried while the budget allows.
pub const RETRYABLE_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Whether to try again, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn retry(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Pure retry logic; holds no state between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay)
    }

    pub fn is_retryable_status(status: StatusCode) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// Decision for a response that arrived with `status` on attempt `attempt` (0-based).
    pub fn on_status(
        &self,
        status: StatusCode,
        retry_after: Option<&str>,
        attempt: u32,
    ) -> RetryDecision {
        if !Self::is_retryable_status(status) || attempt >= self.max_retries {
            return RetryDecision::give_up();
        }

        let delay = retry_after
            .and_then(parse_retry_after)
            .unwrap_or(self.retry_delay);
        RetryDecision::retry(delay)
    }

    /// Decision for a transport failure on attempt `attempt` (0-based).
    pub fn on_transport_error(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::give_up();
        }
        RetryDecision::retry(self.backoff(attempt))
    }

    /// `retry_delay * 2^attempt`, saturating instead of overflowing.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.retry_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_RETRIES,
            crate::config::DEFAULT_RETRY_DELAY,
        )
    }
}

/// Parses a `Retry-After` value given as an integer number of seconds.
///
/// HTTP-date values and anything else malformed yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
