use super::RegistryError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
pub enum RequestAuth {
    Basic { username: String, password: String },
    Bearer(String),
}

impl fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAuth::Basic { username, .. } => write!(f, "Basic({}:<redacted>)", username),
            RequestAuth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// One outbound registry call
#[derive(Debug, Clone)]
pub struct RegistryRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub auth: Option<RequestAuth>,
}

impl RegistryRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            auth: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(RequestAuth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(RequestAuth::Bearer(token.into()));
        self
    }

    /// Host and, when present, port of the target URL
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        match &self.auth {
            Some(RequestAuth::Basic { username, password }) => {
                Some((username.as_str(), password.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RegistryResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Sends registry requests. Decorators wrap another transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        (**self).round_trip(request).await
    }
}

/// Plain HTTP(S) transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rollout/", env!("CARGO_PKG_VERSION")))
            // quay.io hands out its authorisation as a session cookie
            .cookie_store(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.auth {
            Some(RequestAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(RequestAuth::Bearer(token)) => builder.bearer_auth(token),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(RegistryResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct HostLimit {
    /// 0 means no limit
    max_requests_per_second: u32,
    next_request_at: Option<Instant>,
}

/// Throttles requests per host to a fixed rate. Requests that would queue
/// longer than `max_backlog` fail with `TooManyPendingRequests`.
pub struct RateLimitedTransport<T> {
    inner: T,
    max_backlog: Duration,
    limits: Mutex<HashMap<String, HostLimit>>,
}

impl<T: Transport> RateLimitedTransport<T> {
    /// A zero `max_backlog` lets requests queue indefinitely
    pub fn new<I, K>(inner: T, max_backlog: Duration, limits: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        let limits = limits
            .into_iter()
            .map(|(host, max)| {
                (
                    host.into(),
                    HostLimit {
                        max_requests_per_second: max,
                        next_request_at: None,
                    },
                )
            })
            .collect();

        Self {
            inner,
            max_backlog,
            limits: Mutex::new(limits),
        }
    }

    /// Claim the next slot for `host` and return how long to wait for it
    fn reserve(&self, host: &str) -> Result<Duration, RegistryError> {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        let Some(limit) = limits.get_mut(host) else {
            return Ok(Duration::ZERO);
        };
        if limit.max_requests_per_second == 0 {
            return Ok(Duration::ZERO);
        }

        let now = Instant::now();
        let slot = match limit.next_request_at {
            Some(next) if next > now => next,
            _ => now,
        };
        let next = slot + Duration::from_secs(1) / limit.max_requests_per_second;
        // A backlog past the end of the clock never overflows
        let overflows = now
            .checked_add(self.max_backlog)
            .is_some_and(|limit| next > limit);
        if !self.max_backlog.is_zero() && overflows {
            return Err(RegistryError::TooManyPendingRequests(host.to_string()));
        }
        limit.next_request_at = Some(next);

        Ok(slot - now)
    }
}

#[async_trait]
impl<T: Transport> Transport for RateLimitedTransport<T> {
    async fn round_trip(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        let host = request.host();
        let wait = self.reserve(&host)?;
        if !wait.is_zero() {
            debug!(host = %host, wait_ms = wait.as_millis() as u64, "Throttling registry request");
            tokio::time::sleep(wait).await;
        }
        self.inner.round_trip(request).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BackoffKey {
    host: String,
    user: String,
    pass: String,
}

/// Moving average of the rate-limited share of recent requests
#[derive(Debug, Default)]
struct Backoff {
    /// 0 means every recent request succeeded, 1 means all were rate limited
    ratio: f64,
    last_started: Option<Instant>,
}

impl Backoff {
    const WINDOW: f64 = 10.0;

    fn success(&mut self) {
        self.update(0.0);
    }

    fn failure(&mut self) {
        self.update(1.0);
    }

    fn update(&mut self, value: f64) {
        self.ratio = ((Self::WINDOW - 1.0) * self.ratio + value) / Self::WINDOW;
    }

    /// Time to sleep before the next attempt; records that attempt's start
    fn wait(&mut self, max: Duration, now: Instant) -> Duration {
        let target = max.mul_f64(self.ratio * self.ratio);
        let elapsed = self
            .last_started
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::MAX);
        let wait = target.saturating_sub(elapsed);
        self.last_started = Some(now.checked_add(wait).unwrap_or(now));
        wait
    }
}

/// Retries requests answered with HTTP 429, backing off exponentially per
/// host and credential pair.
pub struct BackoffTransport<T> {
    inner: T,
    max: Duration,
    max_attempts: u32,
    backoffs: Mutex<HashMap<BackoffKey, Arc<Mutex<Backoff>>>>,
}

impl<T: Transport> BackoffTransport<T> {
    /// `max_attempts` of 0 retries forever
    pub fn new(inner: T, max: Duration, max_attempts: u32) -> Self {
        Self {
            inner,
            max,
            max_attempts,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    fn backoff_for(&self, request: &RegistryRequest) -> Arc<Mutex<Backoff>> {
        let (user, pass) = request.basic_credentials().unwrap_or(("", ""));
        let key = BackoffKey {
            host: request.host(),
            user: user.to_string(),
            pass: pass.to_string(),
        };
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
        backoffs.entry(key).or_default().clone()
    }
}

#[async_trait]
impl<T: Transport> Transport for BackoffTransport<T> {
    async fn round_trip(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        let backoff = self.backoff_for(&request);
        let mut attempts = 0;

        loop {
            let wait = backoff
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .wait(self.max, Instant::now());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            attempts += 1;
            let response = self.inner.round_trip(request.clone()).await?;
            let mut state = backoff.lock().unwrap_or_else(|e| e.into_inner());
            if response.status != 429 {
                state.success();
                return Ok(response);
            }

            state.failure();
            if self.max_attempts > 0 && attempts >= self.max_attempts {
                warn!(host = %request.host(), attempts, "Giving up on rate-limited registry request");
                return Err(RegistryError::RateLimited {
                    host: request.host(),
                    attempts,
                });
            }
            debug!(host = %request.host(), ratio = state.ratio, "Registry rate limited request, backing off");
        }
    }
}
