//! Polite HTTP client for SUUMO list pages.
//!
//! Every request passes three gates before it goes out: the global
//! concurrency limit, the per-category limit, and the rate limiter. Transient
//! failures (timeouts, connection errors, 429 and 5xx) are retried with
//! doubling delays.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use suumo_core::Category;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .map(|factor| self.first_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// SUUMO throttles with 429 and sheds load with 5xx; everything else is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Token bucket expressed as a theoretical arrival time: `burst` requests may
/// go out back to back, after which one more is allowed every `interval`.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst: burst.max(1),
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Waits until a request may start.
    pub async fn acquire(&self) {
        let wait_until = {
            let mut next_free = self.next_free.lock().await;
            let now = Instant::now();
            let tolerance = self.interval.saturating_mul(self.burst - 1);
            let earliest = next_free.checked_sub(tolerance).unwrap_or(now);
            let start = earliest.max(now);
            *next_free = (*next_free).max(now) + self.interval;
            start
        };
        tokio::time::sleep_until(wait_until).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub global_concurrency: usize,
    pub per_category_concurrency: usize,
    pub retry: RetryPolicy,
    /// `(interval, burst)`; `None` disables rate limiting.
    pub rate_limit: Option<(Duration, u32)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            accept_language: Some("ja,en-US;q=0.9,en;q=0.8".to_string()),
            global_concurrency: 4,
            per_category_concurrency: 1,
            retry: RetryPolicy::default(),
            rate_limit: Some((Duration::from_secs(1), 2)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Semaphore,
    per_category: [Semaphore; Category::ALL.len()],
    rate_limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(lang) = &config.accept_language {
            headers.insert(
                ACCEPT_LANGUAGE,
                HeaderValue::from_str(lang).context("invalid Accept-Language header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        let per_category = config.per_category_concurrency.max(1);
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            global: Semaphore::new(config.global_concurrency.max(1)),
            per_category: std::array::from_fn(|_| Semaphore::new(per_category)),
            rate_limiter: config
                .rate_limit
                .map(|(interval, burst)| Arc::new(RateLimiter::new(interval, burst))),
            retry: config.retry,
        })
    }

    fn category_gate(&self, category: Category) -> &Semaphore {
        let index = Category::ALL
            .iter()
            .position(|c| *c == category)
            .unwrap_or_default();
        &self.per_category[index]
    }

    /// GETs `url` on behalf of `category`, following redirects.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        category: Category,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global.acquire().await.map_err(|_| FetchError::Closed)?;
        let _category = self
            .category_gate(category)
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, category = category.as_str(), url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            let retry_after = self.retry.delay(attempt - 1);
            let exhausted = attempt >= self.retry.attempts;

            let response = match self.client.get(url).send().await {
                Ok(response) => response,
                Err(source) if is_transient_error(&source) && !exhausted => {
                    warn!(attempt, error = %source, "transient request error; retrying");
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(source) => {
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            };

            let status = response.status();
            let final_url = response.url().to_string();
            if status.is_success() {
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| FetchError::Request {
                        url: final_url.clone(),
                        attempts: attempt,
                        source,
                    })?
                    .to_vec();
                debug!(status = status.as_u16(), bytes = body.len(), attempt, "fetched");
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }
            if is_transient_status(status) && !exhausted {
                warn!(attempt, status = status.as_u16(), "transient http status; retrying");
                tokio::time::sleep(retry_after).await;
                continue;
            }
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            attempts: 6,
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_allows_a_burst_then_paces() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 2);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn every_category_has_its_own_gate() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let land = fetcher.category_gate(Category::Land) as *const Semaphore;
        let rental = fetcher.category_gate(Category::Rental) as *const Semaphore;
        assert_ne!(land, rental);
        assert_eq!(fetcher.category_gate(Category::Land).available_permits(), 1);
    }
}
