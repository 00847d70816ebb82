//! Rate-limited HTTP client for the upstream statistics API.
//!
//! Every outbound call passes the same gates in order: circuit breaker
//! availability for the target partition, the process-wide token-bucket
//! rate limiter, the bounded-concurrency semaphore, and finally credential
//! selection from the key pool. Failures are translated into breaker and
//! pool bookkeeping rather than surfaced as errors; callers see `None` and
//! decide whether to retry.

use std::{
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use blotter_core::Clock;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::{
    circuit::CircuitBreaker,
    error::{FetchError, Result},
    keypool::KeyPool,
};

/// Header carrying the API key on upstream requests.
const API_KEY_HEADER: &str = "X-API-KEY";

/// Client construction parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upstream base URL, without a trailing slash.
    pub base_url: String,
    /// Process-wide request rate ceiling.
    pub requests_per_second: u32,
    /// Maximum simultaneous in-flight calls.
    pub max_concurrent: usize,
    /// User-Agent header value.
    pub user_agent: String,
    /// Optional forward proxy for all upstream traffic.
    pub proxy_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            requests_per_second: 10,
            max_concurrent: 10,
            user_agent: concat!("blotter/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy_url: None,
        }
    }
}

/// Aggregate request counters for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// Requests issued since construction.
    pub requests: u64,
    /// Requests that did not yield a payload.
    pub errors: u64,
    /// Errors divided by requests.
    pub error_rate: f64,
    /// Time since the client was constructed.
    pub elapsed: Duration,
    /// Observed request throughput.
    pub requests_per_second: f64,
}

/// HTTP client wrapping reqwest with rate limiting, circuit breaking, and
/// credential rotation.
pub struct FetchClient {
    http: reqwest::Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
    concurrency: Semaphore,
    keys: Arc<KeyPool>,
    circuits: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    requests: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient").field("base_url", &self.base_url).finish_non_exhaustive()
    }
}

impl FetchClient {
    /// Builds a client over the given pool, breaker, and clock.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Configuration` for a zero request rate, an
    /// invalid proxy URL, or a reqwest builder failure.
    pub fn new(
        config: ClientConfig,
        keys: Arc<KeyPool>,
        circuits: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let rps = NonZeroU32::new(config.requests_per_second)
            .ok_or_else(|| FetchError::configuration("requests_per_second must be positive"))?;

        let mut builder = reqwest::Client::builder().user_agent(&config.user_agent);
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| FetchError::configuration(format!("invalid proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| FetchError::configuration(format!("failed to build HTTP client: {e}")))?;

        let started_at = clock.now();

        Ok(Self {
            http,
            base_url: config.base_url,
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            concurrency: Semaphore::new(config.max_concurrent),
            keys,
            circuits,
            clock,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at,
        })
    }

    /// Issues one GET against the upstream API.
    ///
    /// Returns the decoded JSON payload on HTTP 200 and `None` for every
    /// failure mode: circuit open (no network call is made), 429 (the key
    /// is rotated into cooldown), 5xx and transport errors (counted toward
    /// the partition's breaker), or an unexpected status.
    pub async fn get(
        &self,
        path: &str,
        params: &[(&str, String)],
        partition: &str,
        timeout: Duration,
    ) -> Option<Value> {
        if !self.circuits.is_available(partition).await {
            tracing::debug!(partition, path, "circuit open, skipping upstream call");
            return None;
        }

        self.limiter.until_ready().await;
        let _permit = self.concurrency.acquire().await.ok()?;

        let key = self.keys.next_key().await;
        self.requests.fetch_add(1, Ordering::Relaxed);

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .header(API_KEY_HEADER, &key)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    match resp.json::<Value>().await {
                        Ok(payload) => {
                            self.circuits.record_success(partition).await;
                            Some(payload)
                        },
                        Err(e) => {
                            self.errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(path, error = %e, "failed to decode upstream payload");
                            None
                        },
                    }
                } else if status.as_u16() == 429 {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    self.keys.mark_rate_limited(&key).await;
                    None
                } else if status.is_server_error() {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    self.keys.mark_error(&key).await;
                    let tripped = self.circuits.record_failure(partition).await;
                    if tripped {
                        tracing::warn!(partition, status = status.as_u16(), "circuit tripped");
                    }
                    None
                } else {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(path, status = status.as_u16(), "unexpected upstream status");
                    None
                }
            },
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.keys.mark_error(&key).await;
                if e.is_timeout() {
                    tracing::warn!(path, timeout_secs = timeout.as_secs(), "upstream call timed out");
                } else {
                    tracing::warn!(path, error = %e, "upstream transport error");
                }
                self.circuits.record_failure(partition).await;
                None
            },
        }
    }

    /// Wraps `get` with exponential backoff.
    ///
    /// Delays are 2^attempt seconds starting at attempt zero (1s, 2s,
    /// 4s, ...), slept through the injected clock. Returns the first
    /// non-`None` payload, or `None` once attempts are exhausted.
    pub async fn get_with_retry(
        &self,
        path: &str,
        params: &[(&str, String)],
        partition: &str,
        timeout: Duration,
        max_attempts: u32,
    ) -> Option<Value> {
        for attempt in 0..max_attempts {
            if let Some(payload) = self.get(path, params, partition, timeout).await {
                return Some(payload);
            }

            if attempt + 1 < max_attempts {
                let delay = Duration::from_secs(2_u64.saturating_pow(attempt));
                tracing::debug!(path, attempt, delay_secs = delay.as_secs(), "backing off");
                self.clock.sleep(delay).await;
            }
        }

        tracing::warn!(path, max_attempts, "upstream fetch exhausted retries");
        None
    }

    /// Whether the partition's circuit currently admits requests.
    pub async fn partition_available(&self, partition: &str) -> bool {
        self.circuits.is_available(partition).await
    }

    /// The circuit breaker behind this client.
    pub fn circuits(&self) -> &Arc<CircuitBreaker> {
        &self.circuits
    }

    /// The key pool behind this client.
    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    /// Aggregate request counters.
    pub fn stats(&self) -> ClientStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.clock.now().saturating_duration_since(self.started_at);
        let secs = elapsed.as_secs_f64();

        ClientStats {
            requests,
            errors,
            error_rate: if requests == 0 { 0.0 } else { errors as f64 / requests as f64 },
            elapsed,
            requests_per_second: if secs > 0.0 { requests as f64 / secs } else { 0.0 },
        }
    }
}
