use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest poll interval a source or the default may use (30 days)
pub const MAX_POLL_INTERVAL_SECS: u64 = 30 * 24 * 3600;

/// Validators returned by the server on the last successful fetch,
/// replayed as conditional request headers on the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheToken {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CacheToken {
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Encode for the `last_token` column; an empty token is stored as NULL
    pub fn to_column(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            serde_json::to_string(self).ok()
        }
    }

    /// Decode the `last_token` column, treating unreadable values as no token
    pub fn from_column(value: Option<String>) -> Self {
        value
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: i64,
    pub url: String,
    pub title: String,
    /// Poll interval override; `None` uses the configured default
    pub interval_secs: Option<u64>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub cache_token: CacheToken,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub disabled: bool,
    pub created_at: Option<String>,
}

impl FeedSource {
    /// Effective interval, never above `MAX_POLL_INTERVAL_SECS` even for
    /// rows written before the bound existed
    pub fn poll_interval(&self, default: Duration) -> Duration {
        let interval = match self.interval_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => default,
        };
        interval.min(Duration::from_secs(MAX_POLL_INTERVAL_SECS))
    }

    pub fn display_name(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }
}

/// A source as registered by the operator, before it has an id
#[derive(Debug, Clone)]
pub struct NewFeedSource {
    pub url: String,
    pub title: String,
    pub interval_secs: Option<u64>,
    pub sinks: Vec<String>,
}

impl NewFeedSource {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            interval_secs: None,
            sinks: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval_secs: Option<u64>) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    pub fn with_sinks(mut self, sinks: Vec<String>) -> Self {
        self.sinks = sinks;
        self
    }
}
