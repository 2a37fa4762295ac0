use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::domain::CacheToken;
use crate::errors::{FeederError, FeederResult};
use crate::parser::{self, FeedFormat};
use crate::sources::http::HttpFetcher;
use crate::sources::traits::FetchOutcome;

/// Common feed URL patterns to try when the page advertises none
const FEED_PATTERNS: &[&str] = &[
    "/feed/",               // WordPress
    "/index.xml",           // Hugo
    "/atom.xml",            // Hugo/Jekyll Atom
    "/rss.xml",             // Generic RSS
    "/feed.xml",            // Generic feed
    "/feed.json",           // JSON Feed
    "/rss",                 // Some sites
    "/feed",                // Some sites
    "/feeds/posts/default", // Blogger
    "/.rss",                // Some static generators
];

const FEED_LINK_TYPES: &[&str] = &[
    "application/rss+xml",
    "application/atom+xml",
    "application/feed+json",
    "application/json",
    "application/rdf+xml",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFeed {
    pub feed_url: String,
    pub title: Option<String>,
    pub format: FeedFormat,
}

/// Resolve a user-supplied URL to a parseable feed.
///
/// Tries the URL itself, then any `<link rel="alternate">` feeds the page
/// advertises, then the usual paths on the same host.
pub async fn discover(fetcher: &HttpFetcher, url: &str) -> FeederResult<DiscoveredFeed> {
    let parsed = Url::parse(url).map_err(|e| FeederError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FeederError::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }

    let mut last_error = FeederError::FeedValidation(format!("no feed found at {}", url));
    let page = match fetcher.get(url, &CacheToken::default()).await {
        Ok(FetchOutcome::Modified {
            body, content_type, ..
        }) => {
            if let Some(found) = try_parse(url, &body, content_type.as_deref()) {
                return Ok(found);
            }
            String::from_utf8_lossy(&body).into_owned()
        }
        Ok(FetchOutcome::NotModified) => String::new(),
        Err(e) => {
            last_error = e;
            String::new()
        }
    };

    let mut candidates = alternate_links(&page, &parsed);
    candidates.extend(pattern_urls(&parsed));

    for candidate in candidates {
        debug!(candidate = %candidate, "Trying feed candidate");
        match fetcher.get(&candidate, &CacheToken::default()).await {
            Ok(FetchOutcome::Modified {
                body, content_type, ..
            }) => {
                if let Some(found) = try_parse(&candidate, &body, content_type.as_deref()) {
                    return Ok(found);
                }
            }
            Ok(FetchOutcome::NotModified) => {}
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}

fn try_parse(url: &str, body: &[u8], content_type: Option<&str>) -> Option<DiscoveredFeed> {
    let feed = parser::parse(0, body, content_type).ok()?;
    Some(DiscoveredFeed {
        feed_url: url.to_string(),
        title: feed.title,
        format: feed.format,
    })
}

/// Feed URLs advertised by an HTML page, resolved against `base`
fn alternate_links(html: &str, base: &Url) -> Vec<String> {
    if html.is_empty() {
        return Vec::new();
    }

    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(r#"link[rel~="alternate"][href]"#) else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for element in document.select(&selector) {
        let kind = element
            .value()
            .attr("type")
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !FEED_LINK_TYPES.iter().any(|t| kind.starts_with(t)) {
            continue;
        }
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if let Ok(resolved) = base.join(href.trim()) {
            let resolved = resolved.to_string();
            if !links.contains(&resolved) {
                links.push(resolved);
            }
        }
    }
    links
}

fn pattern_urls(base: &Url) -> Vec<String> {
    FEED_PATTERNS
        .iter()
        .filter_map(|pattern| base.join(pattern).ok())
        .map(|u| u.to_string())
        .filter(|u| u != base.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::http::test_server::{response, serve};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Found It</title>
<item><guid>1</guid><title>One</title></item>
</channel></rss>"#;

    #[test]
    fn test_alternate_links_resolved_and_filtered() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/posts/index.xml">
            <link rel="alternate" type="text/html" hreflang="de" href="/de/">
            <link rel="alternate" type="application/atom+xml" href="https://cdn.example.com/atom.xml">
            <link rel="stylesheet" href="/style.css">
        </head></html>"#;
        let base = Url::parse("https://example.com/blog/").unwrap();

        assert_eq!(
            alternate_links(html, &base),
            vec![
                "https://example.com/posts/index.xml",
                "https://cdn.example.com/atom.xml"
            ]
        );
    }

    #[test]
    fn test_pattern_urls_use_host_root() {
        let base = Url::parse("https://example.com/blog/post").unwrap();
        let urls = pattern_urls(&base);
        assert!(urls.contains(&"https://example.com/feed/".to_string()));
        assert!(urls.contains(&"https://example.com/atom.xml".to_string()));
    }

    #[tokio::test]
    async fn test_discover_direct_feed() {
        let server = serve(vec![response(
            "200 OK",
            &[("Content-Type", "application/rss+xml")],
            RSS,
        )])
        .await;
        let fetcher =
            HttpFetcher::new(Duration::from_secs(5), 0, CancellationToken::new()).unwrap();

        let found = discover(&fetcher, &server.url).await.unwrap();
        assert_eq!(found.feed_url, server.url);
        assert_eq!(found.title.as_deref(), Some("Found It"));
        assert_eq!(found.format, FeedFormat::Rss);
    }

    #[tokio::test]
    async fn test_discover_follows_alternate_link() {
        let page = r#"<html><head><link rel="alternate" type="application/rss+xml" href="/real.xml"></head></html>"#;
        let server = serve(vec![
            response("200 OK", &[("Content-Type", "text/html")], page),
            response("200 OK", &[("Content-Type", "application/rss+xml")], RSS),
        ])
        .await;
        let fetcher =
            HttpFetcher::new(Duration::from_secs(5), 0, CancellationToken::new()).unwrap();

        let found = discover(&fetcher, &server.url).await.unwrap();
        assert!(found.feed_url.ends_with("/real.xml"));
        assert!(server.requests.lock().unwrap()[1].starts_with("GET /real.xml"));
    }

    #[tokio::test]
    async fn test_discover_rejects_bad_scheme() {
        let fetcher =
            HttpFetcher::new(Duration::from_secs(5), 0, CancellationToken::new()).unwrap();
        let result = discover(&fetcher, "ftp://example.com/feed").await;
        assert!(matches!(result, Err(FeederError::InvalidUrl(_))));
    }
}
