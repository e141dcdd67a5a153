//! Shared HTTP client for upstream calls, with process-wide rate limiting.
//!
//! All upstream traffic funnels through this client so the token bucket
//! bounds the aggregate request rate regardless of how many workers are
//! active.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::{CrawlError, CrawlResult};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_requests_per_second: u32,
    /// Sent as Origin/Referer; the upstream rejects requests without them.
    pub origin: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            max_requests_per_second: 5,
            origin: "https://dian.ysbang.cn".to_string(),
        }
    }
}

/// reqwest client plus a direct (per-host) governor bucket.
pub struct HttpClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=UTF-8"),
        );
        headers.insert(
            "Origin",
            HeaderValue::from_str(&config.origin).context("Invalid origin")?,
        );
        headers.insert(
            "Referer",
            HeaderValue::from_str(&format!("{}/", config.origin)).context("Invalid referer")?,
        );

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second)
                .context("Rate limit must be greater than 0")?,
        );
        let rate_limiter = RateLimiter::direct(quota);

        Ok(Self {
            client,
            rate_limiter,
            config,
        })
    }

    /// POST a JSON body with the session token attached as both header and
    /// cookie, waiting on the rate limiter first. Cancellation is observed
    /// at every suspension point.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> CrawlResult<Response> {
        if cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }

        tokio::select! {
            _ = self.rate_limiter.until_ready() => {}
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
        }

        let mut request = self.client.post(url).json(body);
        if let Some(token) = token {
            request = request
                .header("Token", token)
                .header("Cookie", format!("Token={token}"));
        }

        tracing::debug!("POST {url}");
        let response = tokio::select! {
            result = request.send() => result.map_err(|e| CrawlError::upstream_client(0, &e.to_string()))?,
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
        };

        Ok(response)
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}
