//! Delivery record storage, HTTP fetch utilities and the top-stories feed for YAHNC.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use yahnc_core::DEFAULT_TIMEOUT;

pub mod feed;
pub mod records;

pub use feed::{dedup_preserving_order, FeedSource, HackerNewsFeed, HnItem};
pub use records::{
    BatchLookup, InMemoryRecordStore, KeyLookup, PgRecordStore, RecordStore, StoreError,
};

pub const CRATE_NAME: &str = "yahnc-storage";

/// Whether a failed GET could succeed if asked again a moment later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transience {
    Transient,
    Permanent,
}

impl Transience {
    fn of_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Transient,
            s if s.is_server_error() => Self::Transient,
            _ => Self::Permanent,
        }
    }

    fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

/// Extra attempts a GET gets after its first failure, pausing twice as long
/// before each one up to `max_pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_pause: Duration,
    pub max_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::retrying(0)
    }
}

impl RetryPolicy {
    pub const fn retrying(retries: usize) -> Self {
        Self {
            retries,
            first_pause: Duration::from_millis(250),
            max_pause: Duration::from_secs(5),
        }
    }

    /// Pause before retry number `retry` (zero based), or `None` once the
    /// policy is spent.
    pub fn pause_before(&self, retry: usize) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map_or(self.max_pause, |factor| self.first_pause.saturating_mul(factor));
        Some(doubled.min(self.max_pause))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
            concurrency: 16,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// At most `burst` calls back to back, refilled evenly across `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub per: Duration,
}

impl RateLimit {
    /// Telegram lets a bot post about 20 messages a minute into one channel.
    pub const TELEGRAM_CHANNEL: Self = Self {
        burst: 20,
        per: Duration::from_secs(60),
    };

    fn per_call(&self) -> Duration {
        self.per / self.burst.max(1)
    }
}

/// Continuously refilling token bucket. A caller that finds it empty sleeps
/// exactly until the next whole token has accrued.
#[derive(Debug)]
struct RateLimiter {
    limit: RateLimit,
    allowance: Mutex<Allowance>,
}

#[derive(Debug)]
struct Allowance {
    tokens: f64,
    as_of: Instant,
}

impl RateLimiter {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            allowance: Mutex::new(Allowance {
                tokens: f64::from(limit.burst.max(1)),
                as_of: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        let burst = f64::from(self.limit.burst.max(1));
        let per_call = self.limit.per_call().as_secs_f64();
        loop {
            let shortfall = {
                let mut allowance = self.allowance.lock().await;
                let now = Instant::now();
                let accrued = if per_call > 0.0 {
                    now.duration_since(allowance.as_of).as_secs_f64() / per_call
                } else {
                    burst
                };
                allowance.tokens = (allowance.tokens + accrued).min(burst);
                allowance.as_of = now;

                if allowance.tokens >= 1.0 {
                    allowance.tokens -= 1.0;
                    return;
                }
                1.0 - allowance.tokens
            };
            tokio::time::sleep(Duration::from_secs_f64(shortfall * per_call)).await;
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
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

/// Shared reqwest client bounded by a concurrency limit, an optional rate limit
/// and the per-call timeout. GETs retry transient failures; POSTs are sent once.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    rate_limiter: Option<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            retry: config.retry,
        })
    }

    async fn throttle(&self) -> tokio::sync::OwnedSemaphorePermit {
        let permit = Arc::clone(&self.limit)
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        permit
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.throttle().await;
        self.get_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let (transience, failure) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => (
                    Transience::of_status(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (Transience::of_error(&err), FetchError::Request(err)),
            };

            match (transience, self.retry.pause_before(retry)) {
                (Transience::Transient, Some(pause)) => {
                    debug!(error = %failure, retry, ?pause, "transient fetch failure; retrying");
                    tokio::time::sleep(pause).await;
                    retry += 1;
                }
                _ => return Err(failure),
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    /// POST a JSON body once and hand back the response whatever its status,
    /// so callers can read API-level error payloads.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.throttle().await;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .instrument(info_span!("http_post"))
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
