use async_trait::async_trait;

use crate::domain::{CacheToken, FeedSource};
use crate::errors::FeederResult;

/// What a conditional fetch produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server confirmed our cached copy is current
    NotModified,
    Modified {
        body: Vec<u8>,
        content_type: Option<String>,
        token: CacheToken,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Retrieve the source's document, sending its cache token as validators.
    /// Transient failures are retried internally; the final error is returned.
    async fn fetch(&self, source: &FeedSource) -> FeederResult<FetchOutcome>;
}
