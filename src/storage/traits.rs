use chrono::{DateTime, Utc};

use crate::domain::{DeliveryRecord, DeliverySummary, Entry, FeedSource, NewFeedSource, StoredEntry};
use crate::errors::FeederResult;

/// A stored entry waiting for a sink, with the title of its source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub entry: StoredEntry,
    pub source_title: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait SourceRepository: Send + Sync {
    fn add(&self, source: &NewFeedSource) -> FeederResult<i64>;
    fn get_by_id(&self, id: i64) -> FeederResult<Option<FeedSource>>;
    fn get_by_url(&self, url: &str) -> FeederResult<Option<FeedSource>>;
    fn get_all(&self) -> FeederResult<Vec<FeedSource>>;
    fn list_enabled(&self) -> FeederResult<Vec<FeedSource>>;
    fn exists(&self, url: &str) -> FeederResult<bool>;

    /// Soft-disable or re-enable; re-enabling clears the failure streak
    fn set_disabled(&self, id: i64, disabled: bool) -> FeederResult<()>;

    /// Persist title, cache token, fetch time and failure state as given.
    /// Does not touch the disabled flag.
    fn update_source_state(&self, source: &FeedSource) -> FeederResult<()>;

    /// A conditional fetch came back unchanged: only the fetch time moves
    fn record_not_modified(&self, id: i64, at: DateTime<Utc>) -> FeederResult<()>;

    /// Count a failed poll, disabling the source once `threshold` is reached.
    /// Returns the updated source.
    fn record_failure(&self, id: i64, error: &str, threshold: u32) -> FeederResult<FeedSource>;

    /// Sinks this source routes to; empty means every configured sink
    fn sinks_for(&self, id: i64) -> FeederResult<Vec<String>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait EntryRepository: Send + Sync {
    /// Insert entries not yet stored; returns the newly inserted ones in input order
    fn save_entries(&self, entries: &[Entry]) -> FeederResult<Vec<StoredEntry>>;

    /// Save new entries and advance the source state in a single transaction
    fn commit_poll(&self, source: &FeedSource, entries: &[Entry]) -> FeederResult<Vec<StoredEntry>>;

    /// Which of `keys` are already stored for the source
    fn known_keys(&self, source_id: i64, keys: &[String]) -> FeederResult<Vec<String>>;

    /// Stored entries routed to `sink_id` that have no resolved delivery there
    fn undelivered_for_sink(&self, sink_id: &str, limit: usize) -> FeederResult<Vec<PendingEntry>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait DeliveryRepository: Send + Sync {
    /// Write a resolved delivery. Never overwrites a delivered record;
    /// returns whether anything was written.
    fn record_delivery(&self, record: &DeliveryRecord) -> FeederResult<bool>;
    fn has_delivered(&self, entry_id: i64, sink_id: &str) -> FeederResult<bool>;
    fn get(&self, entry_id: i64, sink_id: &str) -> FeederResult<Option<DeliveryRecord>>;
    fn summary(&self) -> FeederResult<Vec<DeliverySummary>>;
}
