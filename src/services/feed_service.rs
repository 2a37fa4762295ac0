use tracing::info;

use crate::domain::{DeliverySummary, FeedSource, NewFeedSource, MAX_POLL_INTERVAL_SECS};
use crate::errors::{FeederError, FeederResult};
use crate::sources::{discover, HttpFetcher};
use crate::storage::Store;

/// What the `status` command reports
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub total_sources: usize,
    pub disabled: Vec<FeedSource>,
    pub deliveries: Vec<DeliverySummary>,
}

/// Operator-facing source management
pub struct FeedService {
    store: Store,
    fetcher: HttpFetcher,
}

impl FeedService {
    pub fn new(store: Store, fetcher: HttpFetcher) -> Self {
        Self { store, fetcher }
    }

    /// Add a new source by URL.
    /// The URL may be a feed or a page that advertises one.
    pub async fn add(
        &self,
        url: &str,
        interval_secs: Option<u64>,
        sinks: Vec<String>,
    ) -> FeederResult<FeedSource> {
        let url = url.trim();
        if let Some(secs) = interval_secs {
            if secs == 0 || secs > MAX_POLL_INTERVAL_SECS {
                return Err(FeederError::InvalidInput(format!(
                    "Interval must be between 1 and {} seconds, got {}",
                    MAX_POLL_INTERVAL_SECS, secs
                )));
            }
        }
        if self.exists(url).await? {
            return Err(FeederError::SourceAlreadyExists(url.to_string()));
        }

        let found = discover(&self.fetcher, url).await?;
        if found.feed_url != url && self.exists(&found.feed_url).await? {
            return Err(FeederError::SourceAlreadyExists(found.feed_url));
        }

        let new_source = NewFeedSource::new(found.feed_url, found.title.unwrap_or_default())
            .with_interval(interval_secs)
            .with_sinks(sinks);

        let source = self
            .store
            .run("add_source", move |s| {
                let id = s.sources.add(&new_source)?;
                s.sources
                    .get_by_id(id)?
                    .ok_or_else(|| FeederError::SourceNotFound(id.to_string()))
            })
            .await?;

        info!(id = source.id, url = %source.url, format = ?found.format, "Source added");
        Ok(source)
    }

    /// Soft-disable a source; its entries and delivery history stay
    pub async fn remove(&self, id: i64) -> FeederResult<()> {
        self.store
            .run("disable_source", move |s| s.sources.set_disabled(id, true))
            .await
    }

    /// Re-enable a source and reset its failure streak
    pub async fn enable(&self, id: i64) -> FeederResult<()> {
        self.store
            .run("enable_source", move |s| s.sources.set_disabled(id, false))
            .await
    }

    pub async fn list(&self) -> FeederResult<Vec<FeedSource>> {
        self.store.run("list_sources", |s| s.sources.get_all()).await
    }

    pub async fn list_enabled(&self) -> FeederResult<Vec<FeedSource>> {
        self.store.run("list_enabled", |s| s.sources.list_enabled()).await
    }

    pub async fn exists(&self, url: &str) -> FeederResult<bool> {
        let url = url.to_string();
        self.store
            .run("source_exists", move |s| s.sources.exists(&url))
            .await
    }

    pub async fn status(&self) -> FeederResult<StatusReport> {
        self.store
            .run("status", |s| {
                let sources = s.sources.get_all()?;
                let deliveries = s.deliveries.summary()?;
                Ok(StatusReport {
                    total_sources: sources.len(),
                    disabled: sources.into_iter().filter(|s| s.disabled).collect(),
                    deliveries,
                })
            })
            .await
    }
}
