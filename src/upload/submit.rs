use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::Form;
use reqwest::{Client as HttpClient, Response, StatusCode};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::types::{CollectionId, RenderedItem};

pub const DEFAULT_API_BASE: &str = "https://api.example.com/v2";
pub const DEFAULT_KEY_ENV: &str = "OMNIPUB_API_KEY";
pub const DEFAULT_MAX_CONNS: usize = 256;
const IDLE_TIMEOUT_SECS: u64 = 90;
const REQUEST_TIMEOUT_SECS: u64 = 15;
const ERROR_BODY_LIMIT: usize = 4096;

#[derive(Clone, Debug)]
pub struct OmnipubClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub max_conns: usize,
    pub timeout: Duration,
    pub idle_timeout: Duration,
}

impl OmnipubClientConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, max_conns: usize) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            max_conns: max_conns.max(1),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
        }
    }

    /// Reads the bearer credential from `key_env`. Unset or empty is an error.
    pub fn from_env(key_env: &str, base_url: &str, max_conns: usize) -> Result<Self, SubmitError> {
        let api_key = std::env::var(key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SubmitError::MissingApiKey(key_env.to_string()))?;
        Ok(Self::new(api_key, base_url, max_conns))
    }
}

/// Submits one rendered item and classifies the response. Never retries.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        item: &RenderedItem,
        collection: Option<CollectionId>,
        ct: &CancellationToken,
    ) -> Result<(), SubmitError>;
}

pub struct OmnipubClient {
    http: HttpClient,
    endpoint: String,
    gate: ConnectionGate,
}

impl OmnipubClient {
    pub fn new(cfg: OmnipubClientConfig) -> Result<Self, SubmitError> {
        let base = cfg.base_url.strip_suffix('/').unwrap_or(&cfg.base_url);
        Url::parse(base).map_err(|e| SubmitError::InvalidBaseUrl { url: base.to_string(), reason: e.to_string() })?;

        // reqwest copies default headers into each request; the map itself is never mutated.
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", cfg.api_key))
            .map_err(|_| SubmitError::InvalidApiKey)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = HttpClient::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(cfg.max_conns)
            .pool_idle_timeout(cfg.idle_timeout)
            .timeout(cfg.timeout)
            .build()
            .map_err(SubmitError::Client)?;

        Ok(Self {
            http,
            endpoint: format!("{}/omnipub", base),
            gate: ConnectionGate::new(cfg.max_conns),
        })
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    /// Highest number of requests that were in flight at once.
    pub fn peak_in_flight(&self) -> usize { self.gate.peak.load(Ordering::SeqCst) }

    async fn send(&self, form: Form) -> Result<(), SubmitError> {
        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(SubmitError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = read_capped(response, ERROR_BODY_LIMIT).await;
        Err(SubmitError::Rejected { status, body })
    }
}

#[async_trait]
impl Publisher for OmnipubClient {
    async fn publish(
        &self,
        item: &RenderedItem,
        collection: Option<CollectionId>,
        ct: &CancellationToken,
    ) -> Result<(), SubmitError> {
        let metadata = serde_json::to_string(&item.metadata).map_err(SubmitError::Encode)?;
        let mut form = Form::new()
            .text("html_content", item.html.clone())
            .text("metadata", metadata);
        if let Some(CollectionId(id)) = collection {
            form = form.text("collection_id", id.to_string());
        }

        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(SubmitError::Cancelled),
            res = async {
                let _pass = self.gate.enter().await?;
                self.send(form).await
            } => res,
        }
    }
}

/// Bounds in-flight requests to the host; reqwest only caps idle connections.
struct ConnectionGate {
    permits: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct GatePass<'a> {
    gate: &'a ConnectionGate,
    _permit: SemaphorePermit<'a>,
}

impl ConnectionGate {
    fn new(max_conns: usize) -> Self {
        Self {
            permits: Semaphore::new(max_conns.max(1)),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    async fn enter(&self) -> Result<GatePass<'_>, SubmitError> {
        let permit = self.permits.acquire().await.map_err(|_| SubmitError::Cancelled)?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(GatePass { gate: self, _permit: permit })
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn read_capped(mut response: Response, limit: usize) -> String {
    let mut buf = BytesMut::with_capacity(limit.min(1024));
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = (limit - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[derive(Debug)]
pub enum SubmitError {
    MissingApiKey(String),
    InvalidApiKey,
    InvalidBaseUrl { url: String, reason: String },
    Client(reqwest::Error),
    Encode(serde_json::Error),
    Http(reqwest::Error),
    Timeout(reqwest::Error),
    Cancelled,
    Rejected { status: StatusCode, body: String },
}

impl SubmitError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SubmitError::Timeout(err)
        } else {
            SubmitError::Http(err)
        }
    }

    /// Whether a later re-run could plausibly succeed. Informational only.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Timeout(_) | SubmitError::Http(_) | SubmitError::Cancelled => true,
            SubmitError::Rejected { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            SubmitError::MissingApiKey(_)
            | SubmitError::InvalidApiKey
            | SubmitError::InvalidBaseUrl { .. }
            | SubmitError::Client(_)
            | SubmitError::Encode(_) => false,
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::MissingApiKey(var) => write!(f, "env {:?} not set", var),
            SubmitError::InvalidApiKey => write!(f, "api key is not a valid header value"),
            SubmitError::InvalidBaseUrl { url, reason } => write!(f, "invalid api base {:?}: {}", url, reason),
            SubmitError::Client(err) => write!(f, "failed to build http client: {err}"),
            SubmitError::Encode(err) => write!(f, "metadata encode error: {err}"),
            SubmitError::Http(err) => write!(f, "http error: {err}"),
            SubmitError::Timeout(err) => write!(f, "request timed out: {err}"),
            SubmitError::Cancelled => write!(f, "cancelled"),
            SubmitError::Rejected { status, body } if body.is_empty() => write!(f, "http {}", status.as_u16()),
            SubmitError::Rejected { status, body } => write!(f, "http {} {}", status.as_u16(), body),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Client(err) | SubmitError::Http(err) | SubmitError::Timeout(err) => Some(err),
            SubmitError::Encode(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::test_support::OverlapCounter;
    use crate::upload::types::ItemMetadata;
    use std::error::Error as _;
    use std::time::Instant;
    use wiremock::matchers::{header, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item() -> RenderedItem {
        RenderedItem {
            html: "<h1>T</h1>".into(),
            metadata: ItemMetadata {
                creation_date: "2024-01-01".into(),
                source_url: "https://src.test/1".into(),
                title: "T".into(),
            },
        }
    }

    fn client(base: String, max_conns: usize) -> OmnipubClient {
        OmnipubClient::new(OmnipubClientConfig::new("test-key", base, max_conns)).unwrap()
    }

    async fn bodies(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn posts_multipart_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/omnipub"))
            .and(header("authorization", "Bearer test-key"))
            .and(header_regex("content-type", "^multipart/form-data; boundary="))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(server.uri(), 4);
        c.publish(&item(), Some(CollectionId(42)), &CancellationToken::new()).await.unwrap();

        let body = &bodies(&server).await[0];
        assert!(body.contains("name=\"html_content\""));
        assert!(body.contains("<h1>T</h1>"));
        assert!(body.contains("name=\"metadata\""));
        assert!(body.contains(r#"{"creation_date":"2024-01-01","source_url":"https://src.test/1","title":"T"}"#));
        assert!(body.contains("name=\"collection_id\""));
        assert!(body.contains("\r\n\r\n42\r\n"));
    }

    #[tokio::test]
    async fn omits_collection_when_unset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let c = client(server.uri(), 4);
        c.publish(&item(), None, &CancellationToken::new()).await.unwrap();
        assert!(!bodies(&server).await[0].contains("collection_id"));
    }

    #[tokio::test]
    async fn trailing_slash_is_stripped_from_base() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/omnipub"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(format!("{}/", server.uri()), 4);
        assert_eq!(c.endpoint(), format!("{}/omnipub", server.uri()));
        c.publish(&item(), None, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn non_2xx_is_rejected_with_trimmed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("  upstream down \n"))
            .mount(&server)
            .await;

        let c = client(server.uri(), 4);
        let err = c.publish(&item(), None, &CancellationToken::new()).await.unwrap_err();
        match &err {
            SubmitError::Rejected { status, body } => {
                assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "upstream down");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(err.to_string(), "http 503 upstream down");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn error_body_capture_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(10_000)))
            .mount(&server)
            .await;

        let c = client(server.uri(), 4);
        match c.publish(&item(), None, &CancellationToken::new()).await {
            Err(SubmitError::Rejected { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body.len(), ERROR_BODY_LIMIT);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let c = client("http://127.0.0.1:1".into(), 1);
        let err = c.publish(&item(), None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Http(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut cfg = OmnipubClientConfig::new("k", server.uri(), 1);
        cfg.timeout = Duration::from_millis(50);
        let c = OmnipubClient::new(cfg).unwrap();
        let err = c.publish(&item(), None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Timeout(_)), "got {err:?}");
        assert!(err.to_string().starts_with("request timed out: "), "{err}");
        assert!(err.source().is_some());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ct = CancellationToken::new();
        ct.cancel();
        let err = client(server.uri(), 1).publish(&item(), None, &ct).await.unwrap_err();
        assert!(matches!(err, SubmitError::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_mid_request_aborts_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let c = client(server.uri(), 1);
        let ct = CancellationToken::new();
        let trigger = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = c.publish(&item(), None, &ct).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, SubmitError::Cancelled), "got {err:?}");
        assert!(elapsed < Duration::from_secs(1), "elapsed={elapsed:?}");
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(c.gate.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn in_flight_requests_never_exceed_max_conns() {
        let server = MockServer::start().await;
        let counter = OverlapCounter::new(Duration::from_millis(150));
        Mock::given(method("POST"))
            .respond_with(counter.clone())
            .mount(&server)
            .await;

        let c = client(server.uri(), 2);
        let ct = CancellationToken::new();
        let it = item();
        let calls = (0..6).map(|_| c.publish(&it, None, &ct));
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(counter.total(), 6);
        assert_eq!(counter.peak(), 2, "server saw {} concurrent requests", counter.peak());
    }

    #[test]
    fn missing_credential_is_an_error() {
        let err = OmnipubClientConfig::from_env("OMNIPUB_TEST_KEY_THAT_IS_NEVER_SET", DEFAULT_API_BASE, 4)
            .unwrap_err();
        assert!(matches!(err, SubmitError::MissingApiKey(ref v) if v == "OMNIPUB_TEST_KEY_THAT_IS_NEVER_SET"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn malformed_base_url_is_rejected() {
        let err = OmnipubClient::new(OmnipubClientConfig::new("k", "not a url", 1)).err().unwrap();
        assert!(matches!(err, SubmitError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn zero_max_conns_is_clamped() {
        assert_eq!(OmnipubClientConfig::new("k", DEFAULT_API_BASE, 0).max_conns, 1);
    }
}
