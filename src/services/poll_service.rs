use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedup::DedupStore;
use crate::dispatch::{DeliveryJob, DispatchHandle, RetryPolicy};
use crate::domain::{Entry, FeedSource, Notification, StoredEntry};
use crate::errors::{FeederError, FeederResult};
use crate::metrics::Metrics;
use crate::parser;
use crate::scheduler::{PollOutcome, SourcePoller};
use crate::sources::{FeedFetcher, FetchOutcome};
use crate::storage::Store;

/// Tries for store reads made after a poll has committed
const STORE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub failure_threshold: u32,
    pub dedup_ttl: Duration,
    pub max_entries_per_poll: usize,
}

/// One poll cycle for one source: fetch, parse, filter, persist, enqueue
pub struct PollService {
    fetcher: Arc<dyn FeedFetcher>,
    store: Store,
    dedup: Arc<dyn DedupStore>,
    dispatch: DispatchHandle,
    metrics: Arc<Metrics>,
    settings: PollSettings,
}

impl PollService {
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        store: Store,
        dedup: Arc<dyn DedupStore>,
        dispatch: DispatchHandle,
        metrics: Arc<Metrics>,
        settings: PollSettings,
    ) -> Self {
        Self {
            fetcher,
            store,
            dedup,
            dispatch,
            metrics,
            settings,
        }
    }

    pub async fn poll_source(
        &self,
        source: FeedSource,
        cancel: &CancellationToken,
    ) -> FeederResult<PollOutcome> {
        self.metrics.poll_attempted();
        debug!(url = %source.url, "Polling");

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            fetched = self.fetcher.fetch(&source) => fetched,
        };

        let (body, content_type, token) = match fetched {
            Ok(FetchOutcome::NotModified) => {
                let id = source.id;
                self.store
                    .run("record_not_modified", move |s| {
                        s.sources.record_not_modified(id, Utc::now())
                    })
                    .await?;
                self.metrics.poll_not_modified();
                debug!("Not modified");
                return Ok(PollOutcome::NotModified);
            }
            Ok(FetchOutcome::Modified {
                body,
                content_type,
                token,
            }) => (body, content_type, token),
            Err(e) => return self.fail(&source, e).await,
        };

        let parsed = match parser::parse(source.id, &body, content_type.as_deref()) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(&source, e).await,
        };
        if parsed.skipped > 0 {
            warn!(skipped = parsed.skipped, "Skipped unparsable items");
            self.metrics.items_skipped(parsed.skipped);
        }

        let mut candidates = parsed.entries;
        if candidates.len() > self.settings.max_entries_per_poll {
            debug!(
                total = candidates.len(),
                kept = self.settings.max_entries_per_poll,
                "Capping entries for this poll"
            );
            candidates.truncate(self.settings.max_entries_per_poll);
        }
        let fresh = self.filter_new(source.id, candidates).await?;

        let mut updated = source.clone();
        updated.cache_token = token;
        updated.last_fetched_at = Some(Utc::now());
        updated.failure_count = 0;
        updated.last_error = None;
        if updated.title.is_empty() {
            if let Some(title) = parsed.title.filter(|t| !t.trim().is_empty()) {
                updated.title = title.trim().to_string();
            }
        }

        // Entries and the new token land together or not at all
        let commit_source = updated.clone();
        let stored = self
            .store
            .run("commit_poll", move |s| {
                s.entries.commit_poll(&commit_source, &fresh)
            })
            .await?;

        for stored_entry in &stored {
            self.dedup
                .mark_seen(&stored_entry.entry.dedup_key(), self.settings.dedup_ttl);
        }
        self.metrics.entries_discovered(stored.len());
        self.metrics.poll_succeeded();

        if !stored.is_empty() {
            info!(new_entries = stored.len(), "New entries");
            self.enqueue(&updated, &stored, cancel).await?;
        }

        Ok(PollOutcome::Updated {
            new_entries: stored.len(),
            skipped: parsed.skipped,
        })
    }

    /// Drop entries the cache or the store already know about. The store
    /// check makes a cold or evicted cache safe.
    async fn filter_new(&self, source_id: i64, candidates: Vec<Entry>) -> FeederResult<Vec<Entry>> {
        let mut seen_in_document = HashSet::new();
        let uncached: Vec<Entry> = candidates
            .into_iter()
            .filter(|e| seen_in_document.insert(e.unique_id.clone()))
            .filter(|e| self.dedup.is_new(&e.dedup_key()))
            .collect();
        if uncached.is_empty() {
            return Ok(uncached);
        }

        let keys: Vec<String> = uncached.iter().map(|e| e.unique_id.clone()).collect();
        let known: HashSet<String> = self
            .store
            .run("known_keys", move |s| s.entries.known_keys(source_id, &keys))
            .await?
            .into_iter()
            .collect();

        let mut fresh = Vec::with_capacity(uncached.len());
        for entry in uncached {
            if known.contains(&entry.unique_id) {
                // Warm the cache so the next poll skips the store lookup
                self.dedup.mark_seen(&entry.dedup_key(), self.settings.dedup_ttl);
            } else {
                fresh.push(entry);
            }
        }
        Ok(fresh)
    }

    async fn fail(&self, source: &FeedSource, error: FeederError) -> FeederResult<PollOutcome> {
        self.metrics.poll_failed();
        warn!(url = %source.url, error = %error, "Poll failed");

        let id = source.id;
        let message = error.to_string();
        let threshold = self.settings.failure_threshold;
        let updated = self
            .store
            .run("record_failure", move |s| {
                s.sources.record_failure(id, &message, threshold)
            })
            .await?;

        let disabled = updated.disabled && !source.disabled;
        if disabled {
            warn!(
                url = %source.url,
                failures = updated.failure_count,
                "Source disabled after repeated failures"
            );
            self.metrics.source_disabled();
        }

        Ok(PollOutcome::Failed {
            failures: updated.failure_count,
            disabled,
        })
    }

    /// Sinks this source delivers to: its own routing, or every sink.
    /// The entries are already committed here, so store hiccups are retried.
    async fn target_sinks(
        &self,
        source_id: i64,
        cancel: &CancellationToken,
    ) -> FeederResult<Vec<String>> {
        let routed = self
            .store
            .run_retrying(
                "sinks_for",
                RetryPolicy::new(STORE_ATTEMPTS),
                cancel,
                move |s| s.sources.sinks_for(source_id),
            )
            .await?;
        if routed.is_empty() {
            return Ok(self.dispatch.sink_ids());
        }

        Ok(routed
            .into_iter()
            .filter(|sink| {
                let known = self.dispatch.has_sink(sink);
                if !known {
                    warn!(sink = %sink, "Source routes to an unconfigured sink");
                }
                known
            })
            .collect())
    }

    async fn enqueue(
        &self,
        source: &FeedSource,
        stored: &[StoredEntry],
        cancel: &CancellationToken,
    ) -> FeederResult<()> {
        let sinks = self.target_sinks(source.id, cancel).await?;
        for stored_entry in stored {
            let notification = Notification::from_entry(source, &stored_entry.entry);
            for sink in &sinks {
                let job = DeliveryJob {
                    entry_id: stored_entry.id,
                    notification: notification.clone(),
                };
                // A job that cannot be queued stays pending in the store and
                // is picked up by recovery on the next start
                self.dispatch.enqueue(sink, job, cancel).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourcePoller for PollService {
    async fn poll(&self, source: FeedSource, cancel: CancellationToken) -> FeederResult<PollOutcome> {
        self.poll_source(source, &cancel).await
    }
}
