//! Sends one logical request through the API's session, retrying transient failures.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use log::{debug, error, warn};
use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, RETRY_AFTER};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use super::session::{Session, SessionManager, cookie_header, header_value};
use super::Method;
use crate::config::ClientConfig;
use crate::error::{ApiError, Result};

/// Response body, parsed as JSON when possible.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Json(_) => None,
            Payload::Text(text) => Some(text),
        }
    }

    /// Text payloads become a JSON string.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
        }
    }
}

/// Final result of a request whose transport succeeded.
///
/// Non-2xx statuses land here too; interpreting them is the handler's job.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub payload: Payload,
    pub status: StatusCode,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Non-JSON request bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Raw(String),
    Form(Vec<(String, String)>),
}

/// Per-request transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
    pub body: Option<RequestBody>,
    pub headers: BTreeMap<String, String>,
    /// Merged over the config's default cookies; request values win.
    pub cookies: BTreeMap<String, String>,
    pub allow_redirects: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            query: Vec::new(),
            json: None,
            body: None,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            allow_redirects: true,
        }
    }
}

struct RawResponse {
    status: StatusCode,
    retry_after: Option<String>,
    body: Vec<u8>,
}

/// Drives attempts for one API: session lookup, sending, retry and backoff.
#[derive(Debug)]
pub struct RequestExecutor {
    sessions: SessionManager,
}

impl RequestExecutor {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// `base_url/route`, with any extra path arguments appended as segments.
    ///
    /// Arguments are not escaped; a `/` inside one adds a segment.
    pub fn build_url(base_url: &str, route: &str, path_args: &[String]) -> String {
        let mut url = format!("{}/{}", base_url, route.trim_matches('/'));
        if !path_args.is_empty() {
            url.push('/');
            url.push_str(&path_args.join("/"));
        }
        url
    }

    /// Executes a request, retrying retryable statuses and transport failures.
    ///
    /// Retryable statuses that outlast the budget are returned as-is.
    /// Transport failures that outlast it become [`ApiError::ConnectionFailed`].
    #[tracing::instrument(skip(self, config, path_args, options, cancel), fields(api = %config.name))]
    pub async fn execute(
        &self,
        config: &ClientConfig,
        method: Method,
        route: &str,
        path_args: &[String],
        options: &TransportOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<RequestOutcome> {
        let policy = RetryPolicy::from_config(config);
        let url = Self::build_url(&config.base_url, route, path_args);
        let headers = request_headers(config, options)?;
        let mut attempt = 0;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(ApiError::Cancelled);
            }

            let session = self.sessions.ensure_session(config).await?;

            let response = {
                let Some(_permit) = cancellable(cancel, session.acquire()).await? else {
                    debug!("Session {} closed while waiting for a connection", session.id());
                    continue;
                };
                debug!(
                    "Sending {} to {} ({}/{})",
                    method,
                    url,
                    attempt + 1,
                    policy.max_retries + 1
                );
                cancellable(cancel, send_once(&session, method, &url, &headers, options)).await?
            };

            match response {
                Ok(raw) => {
                    session.touch();

                    let decision = policy.on_status(raw.status, raw.retry_after.as_deref(), attempt);
                    if decision.should_retry {
                        warn!(
                            "Error {} from {}, retrying in {:?} ({}/{})",
                            raw.status.as_u16(),
                            url,
                            decision.delay,
                            attempt + 1,
                            policy.max_retries
                        );
                        sleep(cancel, decision.delay).await?;
                        attempt += 1;
                        continue;
                    }

                    return Ok(RequestOutcome {
                        payload: Payload::from_bytes(&raw.body),
                        status: raw.status,
                        attempts: attempt + 1,
                    });
                }
                Err(e) if e.is_builder() => return Err(ApiError::Request(e)),
                Err(e) => {
                    error!("Connection error on {}: {}", url, e);

                    let decision = policy.on_transport_error(attempt);
                    if !decision.should_retry {
                        return Err(ApiError::ConnectionFailed {
                            attempts: attempt + 1,
                            source: e,
                        });
                    }

                    // The session's sockets may be poisoned.
                    self.sessions.discard(&session);
                    sleep(cancel, decision.delay).await?;
                    attempt += 1;
                }
            }
        }
    }
}

async fn send_once(
    session: &Session,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    options: &TransportOptions,
) -> std::result::Result<RawResponse, reqwest::Error> {
    let mut request = session
        .client(options.allow_redirects)
        .request(method.into(), url)
        .headers(headers.clone());

    if !options.query.is_empty() {
        request = request.query(&options.query);
    }
    if let Some(json) = &options.json {
        request = request.json(json);
    } else if let Some(body) = &options.body {
        request = match body {
            RequestBody::Raw(text) => request.body(text.clone()),
            RequestBody::Form(fields) => request.form(fields),
        };
    }

    let response = request.send().await?;
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await?.to_vec();

    Ok(RawResponse {
        status,
        retry_after,
        body,
    })
}

/// Per-request headers, plus a `Cookie` header when request cookies are given.
fn request_headers(config: &ClientConfig, options: &TransportOptions) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("header name {name:?}: {e}")))?;
        let value = header_value(name.as_str(), value)?;
        headers.insert(name, value);
    }

    if !options.cookies.is_empty() {
        let mut jar = config.default_cookies.clone();
        jar.extend(options.cookies.clone());
        if let Some(cookie) = cookie_header(&jar) {
            headers.insert(COOKIE, header_value(COOKIE.as_str(), &cookie)?);
        }
    }

    Ok(headers)
}

async fn cancellable<F: Future>(cancel: Option<&CancellationToken>, future: F) -> Result<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ApiError::Cancelled),
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}

async fn sleep(cancel: Option<&CancellationToken>, delay: Duration) -> Result<()> {
    cancellable(cancel, tokio::time::sleep(delay)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Instant;

    fn executor() -> RequestExecutor {
        RequestExecutor::new(SessionManager::new("apibase-test"))
    }

    fn config(url: &str) -> ClientConfig {
        ClientConfig::new("test", url)
            .with_retry_delay(Duration::from_millis(10))
            .with_max_retries(2)
    }

    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    #[test]
    fn test_build_url() {
        assert_eq!(
            RequestExecutor::build_url("http://api", "/challenges/", &[]),
            "http://api/challenges"
        );
        assert_eq!(
            RequestExecutor::build_url("http://api", "auteurs", &["42".into(), "x".into()]),
            "http://api/auteurs/42/x"
        );
        // Path arguments are not escaped.
        assert_eq!(
            RequestExecutor::build_url("http://api", "files", &["a/b".into()]),
            "http://api/files/a/b"
        );
    }

    #[test]
    fn test_payload_from_bytes() {
        assert_eq!(
            Payload::from_bytes(br#"[{"id":1}]"#),
            Payload::Json(json!([{"id": 1}]))
        );
        assert_eq!(
            Payload::from_bytes(b"plain text"),
            Payload::Text("plain text".into())
        );
        assert_eq!(Payload::from_bytes(b""), Payload::Text(String::new()));
        assert_eq!(Payload::Text("x".into()).into_json(), json!("x"));
    }

    #[test_log::test(tokio::test)]
    async fn test_execute_returns_json_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/challenges")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 1}]"#)
            .create_async()
            .await;

        let outcome = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "/challenges",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.payload, Payload::Json(json!([{"id": 1}])));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_execute_falls_back_to_text() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/motd")
            .with_status(200)
            .with_body("hello there")
            .create_async()
            .await;

        let outcome = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "motd",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload.as_text(), Some("hello there"));
    }

    #[tokio::test]
    async fn test_client_error_status_is_not_a_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auteurs/999")
            .with_status(404)
            .with_body(r#"{"error": "not found"}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "/auteurs",
                &["999".to_string()],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.status, StatusCode::NOT_FOUND);
        assert_eq!(outcome.payload.as_json().unwrap()["error"], "not found");
    }

    #[test_log::test(tokio::test)]
    async fn test_retryable_status_then_success() {
        let mut server = mockito::Server::new_async().await;
        let unavailable = server
            .mock("GET", "/challenges")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/challenges")
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .expect(1)
            .create_async()
            .await;

        let executor = executor();
        let outcome = executor
            .execute(
                &config(&server.url()),
                Method::Get,
                "challenges",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap();

        unavailable.assert_async().await;
        ok.assert_async().await;
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.attempts, 2);
        // Server errors keep the session.
        assert_eq!(executor.sessions().sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_header_sets_delay() {
        let mut server = mockito::Server::new_async().await;
        let _limited = server
            .mock("GET", "/challenges")
            .with_status(429)
            .with_header("Retry-After", "1")
            .expect(1)
            .create_async()
            .await;
        let _ok = server
            .mock("GET", "/challenges")
            .with_status(200)
            .with_body(r#"[{"id": 2}]"#)
            .expect(1)
            .create_async()
            .await;

        let start = Instant::now();
        let outcome = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "challenges",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.payload, Payload::Json(json!([{"id": 2}])));
    }

    #[tokio::test]
    async fn test_exhausted_retryable_status_returns_last_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/busy")
            .with_status(502)
            .with_body("bad gateway")
            .expect(3)
            .create_async()
            .await;

        let outcome = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "busy",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.status, StatusCode::BAD_GATEWAY);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.payload.as_text(), Some("bad gateway"));
    }

    #[test_log::test(tokio::test)]
    async fn test_transport_failure_exhausts_and_discards_sessions() {
        let executor = executor();
        let start = Instant::now();

        let err = executor
            .execute(
                &config(&closed_port_url()),
                Method::Get,
                "challenges",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap_err();

        match err {
            ApiError::ConnectionFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        // Backoff of 10ms then 20ms.
        assert!(start.elapsed() >= Duration::from_millis(30));
        // One fresh session per retry.
        assert_eq!(executor.sessions().sessions_created(), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried_then_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        // Accepts connections and never answers.
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let executor = executor();
        let err = executor
            .execute(
                &config(&url).with_timeout(Duration::from_millis(100)),
                Method::Get,
                "slow",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap_err();

        match err {
            ApiError::ConnectionFailed { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.is_timeout());
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert_eq!(executor.sessions().sessions_created(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded_by_max_connections() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
                            )
                            .await;
                    });
                }
            });
        }

        let executor = Arc::new(executor());
        let config = Arc::new(config(&url).with_max_connections(3));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let executor = Arc::clone(&executor);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    executor
                        .execute(&config, Method::Get, "slow", &[], &TransportOptions::default(), None)
                        .await
                        .map(|outcome| outcome.status)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), StatusCode::OK);
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrent requests: {peak}");
        assert_eq!(executor.sessions().sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_after_one_attempt() {
        let executor = executor();
        let err = executor
            .execute(
                &config(&closed_port_url()).with_max_retries(0),
                Method::Get,
                "x",
                &[],
                &TransportOptions::default(),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::ConnectionFailed { attempts: 1, .. }));
        assert_eq!(executor.sessions().sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_transport_options_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("lang".into(), "fr".into()),
                Matcher::UrlEncoded("id_auteur[]".into(), "7".into()),
            ]))
            .match_header("x-trace", "abc")
            .match_header("cookie", "api_key=default; lang=fr")
            .match_body(Matcher::Json(json!({"model": "codestral-latest"})))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let options = TransportOptions {
            query: vec![
                ("lang".into(), "fr".into()),
                ("id_auteur[]".into(), "7".into()),
            ],
            json: Some(json!({"model": "codestral-latest"})),
            headers: BTreeMap::from([("X-Trace".to_string(), "abc".to_string())]),
            cookies: BTreeMap::from([("lang".to_string(), "fr".to_string())]),
            ..Default::default()
        };

        executor()
            .execute(
                &config(&server.url()).with_cookie("api_key", "default"),
                Method::Post,
                "/v1/chat/completions",
                &[],
                &options,
                None,
            )
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_form_body_is_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/profile")
            .match_body(Matcher::UrlEncoded("nom".into(), "g0uZ".into()))
            .with_status(204)
            .create_async()
            .await;

        let options = TransportOptions {
            body: Some(RequestBody::Form(vec![("nom".into(), "g0uZ".into())])),
            ..Default::default()
        };
        let outcome = executor()
            .execute(
                &config(&server.url()),
                Method::Put,
                "profile",
                &[],
                &options,
                None,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_redirects_can_be_disabled() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/old")
            .with_status(302)
            .with_header("location", "/new")
            .create_async()
            .await;
        let target = server
            .mock("GET", "/new")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let options = TransportOptions {
            allow_redirects: false,
            ..Default::default()
        };
        let outcome = executor()
            .execute(&config(&server.url()), Method::Get, "old", &[], &options, None)
            .await
            .unwrap();

        target.assert_async().await;
        assert_eq!(outcome.status, StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_invalid_header_fails_before_sending() {
        let err = executor()
            .execute(
                &config(&closed_port_url()),
                Method::Get,
                "x",
                &[],
                &TransportOptions {
                    headers: BTreeMap::from([("bad header".to_string(), "v".to_string())]),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/challenges")
            .expect(0)
            .create_async()
            .await;

        let token = CancellationToken::new();
        token.cancel();

        let err = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "challenges",
                &[],
                &TransportOptions::default(),
                Some(&token),
            )
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, ApiError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_skips_remaining_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/challenges")
            .with_status(503)
            .with_header("Retry-After", "30")
            .expect(1)
            .create_async()
            .await;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = executor()
            .execute(
                &config(&server.url()),
                Method::Get,
                "challenges",
                &[],
                &TransportOptions::default(),
                Some(&token),
            )
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, ApiError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
