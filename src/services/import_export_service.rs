use opml::{Outline, OPML};
use tracing::{debug, warn};

use crate::domain::{FeedSource, NewFeedSource};
use crate::errors::{FeederError, FeederResult};
use crate::sources::{discover, HttpFetcher};
use crate::storage::Store;

pub struct ImportResult {
    pub added: Vec<FeedSource>,
    pub invalid: Vec<(String, String)>, // (url, error_message)
    pub duplicates: Vec<String>,
}

pub struct ImportExportService {
    store: Store,
    fetcher: HttpFetcher,
}

impl ImportExportService {
    pub fn new(store: Store, fetcher: HttpFetcher) -> Self {
        Self { store, fetcher }
    }

    /// Import sources from OPML content.
    /// Each outline URL is validated the same way `add` does; one bad URL
    /// does not stop the rest.
    pub async fn import_opml(&self, content: &str) -> FeederResult<ImportResult> {
        let opml = OPML::from_str(content).map_err(|e| FeederError::OpmlParse(e.to_string()))?;

        let mut result = ImportResult {
            added: Vec::new(),
            invalid: Vec::new(),
            duplicates: Vec::new(),
        };

        for (url, title) in extract_feeds(&opml.body.outlines) {
            if self.exists(&url).await? {
                result.duplicates.push(url);
                continue;
            }

            let found = match discover(&self.fetcher, &url).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(url = %url, error = %e, "Skipping OPML entry");
                    result.invalid.push((url, e.to_string()));
                    continue;
                }
            };
            if found.feed_url != url && self.exists(&found.feed_url).await? {
                result.duplicates.push(url);
                continue;
            }

            // The outline title wins over the one in the document
            let title = title.or(found.title).unwrap_or_default();
            let new_source = NewFeedSource::new(found.feed_url, title);
            let added = self
                .store
                .run("import_source", move |s| {
                    let id = s.sources.add(&new_source)?;
                    s.sources
                        .get_by_id(id)?
                        .ok_or_else(|| FeederError::SourceNotFound(id.to_string()))
                })
                .await;

            match added {
                Ok(source) => {
                    debug!(id = source.id, url = %source.url, "Imported source");
                    result.added.push(source);
                }
                Err(e) => result.invalid.push((url, e.to_string())),
            }
        }

        Ok(result)
    }

    /// Export every source, enabled or not, as OPML
    pub async fn export_opml(&self) -> FeederResult<String> {
        let sources = self.store.run("export_sources", |s| s.sources.get_all()).await?;
        render_opml(&sources)
    }

    async fn exists(&self, url: &str) -> FeederResult<bool> {
        let url = url.to_string();
        self.store
            .run("source_exists", move |s| s.sources.exists(&url))
            .await
    }
}

/// Recursively collect `(xml_url, title)` pairs, deduplicated in document order
fn extract_feeds(outlines: &[Outline]) -> Vec<(String, Option<String>)> {
    let mut feeds: Vec<(String, Option<String>)> = Vec::new();
    collect_feeds(outlines, &mut feeds);
    feeds
}

fn collect_feeds(outlines: &[Outline], feeds: &mut Vec<(String, Option<String>)>) {
    for outline in outlines {
        if let Some(url) = outline.xml_url.as_deref().map(str::trim) {
            if !url.is_empty() && !feeds.iter().any(|(u, _)| u == url) {
                let title = outline
                    .title
                    .clone()
                    .or_else(|| Some(outline.text.clone()))
                    .filter(|t| !t.trim().is_empty());
                feeds.push((url.to_string(), title));
            }
        }

        collect_feeds(&outline.outlines, feeds);
    }
}

fn render_opml(sources: &[FeedSource]) -> FeederResult<String> {
    let mut opml = OPML::default();
    opml.head = Some(opml::Head {
        title: Some("feedrelay subscriptions".to_string()),
        ..Default::default()
    });

    for source in sources {
        let name = source.display_name().to_string();
        opml.body.outlines.push(Outline {
            text: name.clone(),
            r#type: Some("rss".to_string()),
            xml_url: Some(source.url.clone()),
            title: Some(name),
            ..Default::default()
        });
    }

    opml.to_string()
        .map_err(|e| FeederError::OpmlParse(e.to_string()))
}
