//! Rate-limited HTTP transport with retry and backoff for upstream sources.
//!
//! One transport instance models a single logical worker: every request
//! issued through it, from any task, waits out the same minimum interval.
//! Ranking publishers penalize bursts, so the pacing gate is deliberately
//! conservative.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Terminal failure of one fetch, after the retry budget is spent.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("throttled by upstream after {attempts} attempts: {url}")]
    Throttled { url: String, attempts: usize },
    #[error("unreachable: {url}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// How a response status is retried, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Success,
    /// 429/503: throttling signal, exponential backoff.
    Backoff,
    /// 404: terminal, never retried.
    Terminal,
    /// Any other non-success status: fixed-delay retry.
    FixedDelay,
}

pub fn classify_status(status: StatusCode) -> RetryClass {
    if status.is_success() {
        RetryClass::Success
    } else if status == StatusCode::NOT_FOUND {
        RetryClass::Terminal
    } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        RetryClass::Backoff
    } else {
        RetryClass::FixedDelay
    }
}

/// Timeouts and connection-level errors are worth another attempt; anything
/// else (TLS, body decode, redirect loops) is not.
pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Base of the exponential backoff schedule used for throttling.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fixed delay between retries of non-throttle failures.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(80),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// base * 2^attempt, capped.
    pub fn backoff_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.backoff_base.saturating_mul(factor);
        delay.min(self.backoff_cap)
    }
}

/// Pacing gate owning the shared last-request clock. Callers queue on the
/// internal lock, so requests through one limiter are strictly sequential
/// even under concurrent callers.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until the minimum interval since the previous request has
    /// elapsed, then stamp the clock.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                debug!(wait_ms = (ready_at - now).as_millis() as u64, "pacing outbound request");
                time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Timestamp of the most recent request issued through this limiter.
    pub async fn last_request_at(&self) -> Option<Instant> {
        *self.last_request.lock().await
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub min_interval: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub final_url: String,
}

/// HTTP client wrapper that serializes requests through a [`RateLimiter`]
/// and applies the retry taxonomy: backoff on throttling, fixed-delay
/// retries on transient failures, immediate surface on 404.
#[derive(Debug)]
pub struct RateLimitedTransport {
    client: reqwest::Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl RateLimitedTransport {
    pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limiter: RateLimiter::new(config.min_interval),
            retry: config.retry,
        })
    }

    /// The pacing gate, exposed so callers and tests can observe the clock.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn fetch(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<TransportResponse, FetchError> {
        self.request(Method::GET, url, headers, None).await
    }

    /// Issue one request with the full retry schedule. The body, when
    /// present, is resent verbatim on every attempt; callers set their own
    /// content type header.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<TransportResponse, FetchError> {
        debug!(method = %method, url, "issuing request");

        let mut attempt = 0usize;
        loop {
            self.limiter.acquire().await;

            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(bytes) = &body {
                request = request.body(bytes.clone());
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match classify_status(status) {
                        RetryClass::Success => {
                            let response_headers = resp.headers().clone();
                            let bytes =
                                resp.bytes().await.map_err(|err| FetchError::Unreachable {
                                    url: url.to_string(),
                                    source: err,
                                })?;
                            return Ok(TransportResponse {
                                status,
                                headers: response_headers,
                                body: bytes.to_vec(),
                                final_url,
                            });
                        }
                        RetryClass::Terminal => {
                            return Err(FetchError::NotFound {
                                url: url.to_string(),
                            });
                        }
                        RetryClass::Backoff => {
                            if attempt < self.retry.max_retries {
                                let wait = self.retry.backoff_for_attempt(attempt);
                                warn!(
                                    status = status.as_u16(),
                                    wait_ms = wait.as_millis() as u64,
                                    url,
                                    "throttled, backing off"
                                );
                                time::sleep(wait).await;
                                attempt += 1;
                                continue;
                            }
                            return Err(FetchError::Throttled {
                                url: url.to_string(),
                                attempts: attempt + 1,
                            });
                        }
                        RetryClass::FixedDelay => {
                            if attempt < self.retry.max_retries {
                                warn!(status = status.as_u16(), url, "unexpected status, retrying");
                                time::sleep(self.retry.retry_delay).await;
                                attempt += 1;
                                continue;
                            }
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: url.to_string(),
                            });
                        }
                    }
                }
                Err(err) if is_transient(&err) => {
                    if attempt < self.retry.max_retries {
                        warn!(error = %err, url, "transport error, retrying");
                        time::sleep(self.retry.retry_delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Unreachable {
                        url: url.to_string(),
                        source: err,
                    });
                }
                Err(err) => {
                    return Err(FetchError::Unreachable {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK), RetryClass::Success);
        assert_eq!(classify_status(StatusCode::CREATED), RetryClass::Success);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryClass::Terminal);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryClass::Backoff
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryClass::Backoff
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryClass::FixedDelay
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryClass::FixedDelay);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(350),
            retry_delay: Duration::from_millis(10),
        };

        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn backoff_waits_grow_at_least_twofold_below_the_cap() {
        let policy = RetryPolicy::default();
        let mut previous = policy.backoff_for_attempt(0);
        for attempt in 1..3 {
            let wait = policy.backoff_for_attempt(attempt);
            assert!(wait >= previous, "wait shrank at attempt {attempt}");
            assert!(wait >= previous * 2, "wait not doubled at attempt {attempt}");
            previous = wait;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_enforces_min_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let started = Instant::now();

        limiter.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(5));

        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_clock_advances_per_request() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(limiter.last_request_at().await.is_none());

        limiter.acquire().await;
        let first = limiter.last_request_at().await.expect("first stamp");

        limiter.acquire().await;
        let second = limiter.last_request_at().await.expect("second stamp");
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_does_not_delay_after_a_long_idle_gap() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.acquire().await;

        time::sleep(Duration::from_secs(30)).await;
        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
