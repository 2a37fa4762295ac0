pub mod source;
pub mod entry;
pub mod delivery;
pub mod notification;

pub use source::{CacheToken, FeedSource, NewFeedSource, MAX_POLL_INTERVAL_SECS};
pub use entry::{DedupKey, Entry, StoredEntry};
pub use delivery::{DeliveryRecord, DeliveryStatus, DeliverySummary};
pub use notification::Notification;
