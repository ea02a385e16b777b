//! Per-API static configuration.

use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Configuration shared by every request issued against one remote API.
///
/// Values are treated as an immutable snapshot once handed to an [`crate::Api`];
/// changes go through [`ClientConfig::configure`] and a snapshot swap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientConfig {
    /// Identity of the API, used in logs and to scope its session.
    pub name: String,
    pub base_url: String,
    pub default_headers: BTreeMap<String, String>,
    pub default_cookies: BTreeMap<String, String>,
    /// Overall bound on a single attempt.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Idle time after which a session is closed and replaced.
    pub session_ttl: Duration,
    /// Concurrent connections allowed per session.
    pub max_connections: usize,
    pub verify_tls: bool,
}

impl ClientConfig {
    /// A configuration with the default timeout, retry and pool settings.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: normalize_base_url(base_url.into()),
            default_headers: BTreeMap::new(),
            default_cookies: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            session_ttl: DEFAULT_SESSION_TTL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            verify_tls: true,
        }
    }

    /// Adds a header sent on every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Adds a cookie sent on every request.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_cookies.insert(name.into(), value.into());
        self
    }

    /// Bound on each attempt, connect through body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retries after the first attempt; `0` disables retrying.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Base delay, doubled per attempt after transport errors.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Idle time before the session is rebuilt.
    pub fn with_session_ttl(mut self, session_ttl: Duration) -> Self {
        self.session_ttl = session_ttl;
        self
    }

    /// Concurrent requests allowed through one session.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// `false` accepts invalid TLS certificates.
    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    /// Applies a partial update: only the `Some` fields overwrite current values.
    pub fn configure(mut self, update: ConfigUpdate) -> Self {
        if let Some(base_url) = update.base_url {
            self.base_url = normalize_base_url(base_url);
        }
        if let Some(headers) = update.headers {
            self.default_headers = headers;
        }
        if let Some(cookies) = update.cookies {
            self.default_cookies = cookies;
        }
        if let Some(timeout) = update.timeout {
            self.timeout = timeout;
        }
        if let Some(max_retries) = update.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(retry_delay) = update.retry_delay {
            self.retry_delay = retry_delay;
        }
        if let Some(session_ttl) = update.session_ttl {
            self.session_ttl = session_ttl;
        }
        if let Some(max_connections) = update.max_connections {
            self.max_connections = max_connections;
        }
        if let Some(verify_tls) = update.verify_tls {
            self.verify_tls = verify_tls;
        }
        self
    }
}

/// Partial update for [`ClientConfig::configure`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    pub base_url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub cookies: Option<BTreeMap<String, String>>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub session_ttl: Option<Duration>,
    pub max_connections: Option<usize>,
    pub verify_tls: Option<bool>,
}

fn normalize_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
