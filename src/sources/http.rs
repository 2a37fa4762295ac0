use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{CacheToken, FeedSource};
use crate::errors::{FeederError, FeederResult};
use crate::sources::traits::{FeedFetcher, FetchOutcome};

/// Largest document we are willing to buffer
pub const MAX_FEED_SIZE: u64 = 5 * 1024 * 1024;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("feedrelay/", env!("CARGO_PKG_VERSION"));
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fetches feed documents over HTTP with conditional requests and bounded
/// in-attempt retries.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    retries: u32,
    backoff: Duration,
    cancel: CancellationToken,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, retries: u32, cancel: CancellationToken) -> FeederResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            retries,
            backoff: DEFAULT_BACKOFF,
            cancel,
        })
    }

    /// Base delay before the first retry; doubles on each following one
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// GET `url` with validators from `token`, retrying transient failures
    pub async fn get(&self, url: &str, token: &CacheToken) -> FeederResult<FetchOutcome> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(FeederError::TransientNetwork(format!("fetch of {} cancelled", url)));
                }
                result = self.get_once(url, token) => result,
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = self
                        .backoff
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_BACKOFF);
                    attempt += 1;
                    debug!(url, attempt, ?delay, error = %e, "Retrying fetch");

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!(url, attempts = attempt + 1, error = %e, "Fetch gave up");
                    }
                    return Err(e);
                }
                Ok(outcome) => return Ok(outcome),
            }
        }
    }

    async fn get_once(&self, url: &str, token: &CacheToken) -> FeederResult<FetchOutcome> {
        let mut request = self.client.get(url);
        if let Some(etag) = &token.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &token.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let mut response = request.send().await.map_err(classify)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FeederError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(length) = response.content_length() {
            if length > MAX_FEED_SIZE {
                return Err(too_large(url));
            }
        }

        let content_type = header_string(response.headers(), CONTENT_TYPE);
        let token = CacheToken::new(
            header_string(response.headers(), ETAG),
            header_string(response.headers(), LAST_MODIFIED),
        );

        // Content-Length can be absent or wrong, so enforce the cap while reading
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if body.len() as u64 + chunk.len() as u64 > MAX_FEED_SIZE {
                return Err(too_large(url));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchOutcome::Modified {
            body,
            content_type,
            token,
        })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source: &FeedSource) -> FeederResult<FetchOutcome> {
        self.get(&source.url, &source.cache_token).await
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn too_large(url: &str) -> FeederError {
    FeederError::FeedValidation(format!(
        "{} exceeds the {} byte document limit",
        url, MAX_FEED_SIZE
    ))
}

fn classify(err: reqwest::Error) -> FeederError {
    if err.is_timeout() {
        FeederError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        FeederError::TransientNetwork(err.to_string())
    } else {
        FeederError::Http(err)
    }
}
