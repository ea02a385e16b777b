//! Lifecycle of the pooled connection session owned by one API.
//!
//! States: absent -> active (on `ensure_session`) -> expired (idle past the
//! TTL) -> absent (on close). A transport failure discards an active session
//! directly, and so does a caller holding a different configuration than the
//! one the session was built from. Sessions are replaced, never mutated in
//! place, so readers always see a fully built session.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use log::debug;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, redirect};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{ApiError, Result};

/// Headers whose values must never show up in debug output.
const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "cookie", "x-api-key"];

/// A pooled connection context bound to one API's base URL.
#[derive(Debug)]
pub struct Session {
    id: u64,
    // Hash of the ClientConfig the clients were built from
    fingerprint: u64,
    client: Client,
    // reqwest fixes the redirect policy per client
    no_redirect_client: Client,
    permits: Semaphore,
    last_used: Mutex<Instant>,
    closed: AtomicBool,
}

impl Session {
    fn build(id: u64, fingerprint: u64, config: &ClientConfig, user_agent: &str) -> Result<Self> {
        let headers = default_headers(config)?;
        let builder = || {
            Client::builder()
                .user_agent(user_agent)
                .default_headers(headers.clone())
                .timeout(config.timeout)
                .pool_max_idle_per_host(config.max_connections)
                .danger_accept_invalid_certs(!config.verify_tls)
        };

        let client = builder().build().map_err(ApiError::Request)?;
        let no_redirect_client = builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(ApiError::Request)?;

        Ok(Self {
            id,
            fingerprint,
            client,
            no_redirect_client,
            permits: Semaphore::new(config.max_connections.max(1)),
            last_used: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    /// Sequence number of this session within its manager; stable identity for the session's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The HTTP client to send with, following redirects or not.
    pub fn client(&self, allow_redirects: bool) -> &Client {
        if allow_redirects {
            &self.client
        } else {
            &self.no_redirect_client
        }
    }

    /// Waits for a free connection slot. `None` once the session has been closed.
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.permits.acquire().await.ok()
    }

    /// When a request last went through this session.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the session as used now, pushing back its expiry.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    fn touch_at(&self, now: Instant) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// Time since the last use, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    /// Whether this session was built from `config`.
    pub fn built_from(&self, config: &ClientConfig) -> bool {
        self.fingerprint == fingerprint(config)
    }

    /// Closed sessions accept no new requests.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
    }
}

/// Owns at most one live [`Session`] for an API.
#[derive(Debug)]
pub struct SessionManager {
    slot: RwLock<Option<Arc<Session>>>,
    create_lock: tokio::sync::Mutex<()>,
    created: AtomicU64,
    user_agent: String,
}

impl SessionManager {
    /// A manager with no session yet; `user_agent` goes on every session it builds.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            slot: RwLock::new(None),
            create_lock: tokio::sync::Mutex::new(()),
            created: AtomicU64::new(0),
            user_agent: user_agent.into(),
        }
    }

    /// Returns a live session built from `config`, replacing an expired one
    /// or one built from a different configuration.
    ///
    /// Concurrent callers racing on an absent session build exactly one.
    #[tracing::instrument(skip(self, config), fields(api = %config.name))]
    pub async fn ensure_session(&self, config: &ClientConfig) -> Result<Arc<Session>> {
        let now = Instant::now();
        let fingerprint = fingerprint(config);

        if let Some(session) = self.current() {
            if session.idle_for(now) > config.session_ttl {
                debug!("Session {} for {} expired, closing...", session.id(), config.name);
                self.discard(&session);
            } else if session.fingerprint != fingerprint {
                debug!(
                    "Session {} for {} was built from another configuration, closing...",
                    session.id(),
                    config.name
                );
                self.discard(&session);
            }
        }

        let current = self
            .current()
            .filter(|session| session.fingerprint == fingerprint);
        let session = match current {
            Some(session) => session,
            None => {
                let _guard = self.create_lock.lock().await;
                match self.current() {
                    Some(session) if session.fingerprint == fingerprint => session,
                    other => {
                        if let Some(stale) = other {
                            self.discard(&stale);
                        }
                        let id = self.created.load(Ordering::Acquire) + 1;
                        debug!("Creating session {} for {}...", id, config.name);
                        let session = Arc::new(Session::build(
                            id,
                            fingerprint,
                            config,
                            &self.user_agent,
                        )?);
                        self.created.store(id, Ordering::Release);
                        *self.slot.write().unwrap_or_else(PoisonError::into_inner) =
                            Some(Arc::clone(&session));
                        session
                    }
                }
            }
        };

        session.touch_at(now);
        Ok(session)
    }

    /// Closes the current session, if any. Safe to call repeatedly.
    pub fn close(&self) {
        let taken = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = taken {
            session.close();
            debug!("Session {} closed", session.id());
        }
    }

    /// Closes `session` only if it is still the current one, so a replacement
    /// built by a concurrent caller survives.
    pub fn discard(&self, session: &Arc<Session>) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
            slot.take();
            debug!("Session {} discarded", session.id());
        }
        session.close();
    }

    /// The current session if it is still open.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Number of sessions built over this manager's lifetime.
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }
}

fn fingerprint(config: &ClientConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    config.hash(&mut hasher);
    hasher.finish()
}

fn default_headers(config: &ClientConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.default_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("header name {name:?}: {e}")))?;
        let value = header_value(name.as_str(), value)?;
        headers.insert(name, value);
    }

    if let Some(cookie) = cookie_header(&config.default_cookies) {
        headers.insert(COOKIE, header_value(COOKIE.as_str(), &cookie)?);
    }

    Ok(headers)
}

pub(crate) fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| ApiError::InvalidRequest(format!("header {name}: {e}")))?;
    if SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
        value.set_sensitive(true);
    }
    Ok(value)
}

/// `name=value; name2=value2`, or `None` for an empty jar.
pub(crate) fn cookie_header<'a, I>(cookies: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let joined = cookies
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}
