use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix marking identifiers computed from content rather than a feed GUID
pub const CONTENT_HASH_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub source_id: i64,
    pub unique_id: String,
    pub title: String,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
}

impl Entry {
    /// Build an entry, deriving its identifier from the GUID when present and
    /// from (link, title, published) otherwise.
    pub fn new(
        source_id: i64,
        guid: Option<&str>,
        title: String,
        link: Option<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Self {
        let unique_id = derive_unique_id(guid, link.as_deref(), &title, published_at);
        Self {
            source_id,
            unique_id,
            title,
            link,
            published_at,
            snippet: None,
        }
    }

    pub fn with_snippet(mut self, snippet: Option<String>) -> Self {
        self.snippet = snippet;
        self
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.source_id, &self.unique_id)
    }

    pub fn has_content_hash_id(&self) -> bool {
        self.unique_id.starts_with(CONTENT_HASH_PREFIX)
    }
}

/// Stable identifier for a feed item.
///
/// Blank GUIDs count as absent. The hash input uses NUL separators so that
/// moving text between fields cannot produce the same digest.
pub fn derive_unique_id(
    guid: Option<&str>,
    link: Option<&str>,
    title: &str,
    published_at: Option<DateTime<Utc>>,
) -> String {
    if let Some(guid) = guid.map(str::trim).filter(|g| !g.is_empty()) {
        return guid.to_string();
    }

    let published = published_at
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(link.unwrap_or_default().trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(title.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(published.as_bytes());

    format!("{}{:x}", CONTENT_HASH_PREFIX, hasher.finalize())
}

/// Key recorded in the dedup store once an entry is scheduled for delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(source_id: i64, unique_id: &str) -> Self {
        Self(format!("{}:{}", source_id, unique_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entry together with its row id in the persistence store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: i64,
    pub entry: Entry,
}
