//! Feed document parsing.
//!
//! Turns raw RSS, Atom or JSON Feed bytes into normalized [`Entry`] values.
//! Parsing is a pure function of its input: the same bytes always produce the
//! same entries with the same identifiers.

mod salvage;

use std::sync::OnceLock;

use feed_rs::model;
use regex::Regex;

use crate::domain::Entry;
use crate::errors::{FeederError, FeederResult};

/// Maximum length of an entry snippet, in characters
pub const MAX_SNIPPET_CHARS: usize = 280;

/// The closed set of document formats we accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
    JsonFeed,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Rss => "rss",
            FeedFormat::Atom => "atom",
            FeedFormat::JsonFeed => "json",
        }
    }

    /// Pick a format from the content type, sniffing the document when the
    /// type is missing or generic (`text/xml`, `text/plain`, ...)
    pub fn detect(content_type: Option<&str>, bytes: &[u8]) -> Option<Self> {
        content_type
            .and_then(Self::from_content_type)
            .or_else(|| Self::sniff(bytes))
    }

    fn from_content_type(content_type: &str) -> Option<Self> {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("json") {
            Some(FeedFormat::JsonFeed)
        } else if content_type.contains("atom") {
            Some(FeedFormat::Atom)
        } else if content_type.contains("rss") || content_type.contains("rdf") {
            Some(FeedFormat::Rss)
        } else {
            None
        }
    }

    fn sniff(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let start = bytes.iter().position(|b| !b.is_ascii_whitespace())?;
        if bytes[start] == b'{' {
            return Some(FeedFormat::JsonFeed);
        }

        let head_len = bytes.len().min(4096);
        let head = String::from_utf8_lossy(&bytes[..head_len]);
        let rss = head.find("<rss").or_else(|| head.find("<rdf:RDF"));
        let atom = head.find("<feed");

        match (rss, atom) {
            (Some(r), Some(a)) if a < r => Some(FeedFormat::Atom),
            (Some(_), _) => Some(FeedFormat::Rss),
            (None, Some(_)) => Some(FeedFormat::Atom),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    pub title: Option<String>,
    /// Entries in document order
    pub entries: Vec<Entry>,
    /// Items that could not be parsed or had nothing to identify them by
    pub skipped: usize,
}

/// Parse a feed document into entries for `source_id`.
///
/// A document that fails to parse as a whole is salvaged item by item;
/// broken items are skipped. Errors only when the format is unknown or
/// nothing at all could be recovered from a broken document.
pub fn parse(source_id: i64, bytes: &[u8], content_type: Option<&str>) -> FeederResult<ParsedFeed> {
    let format = FeedFormat::detect(content_type, bytes)
        .ok_or_else(|| FeederError::Parse("unrecognized feed format".to_string()))?;

    match parse_document(bytes) {
        Ok(feed) => {
            let title = feed.title.as_ref().map(|t| plain_text(&t.content));
            let mut skipped = 0;
            let entries = feed
                .entries
                .into_iter()
                .filter_map(|e| {
                    let entry = convert_entry(source_id, e);
                    if entry.is_none() {
                        skipped += 1;
                    }
                    entry
                })
                .collect();

            Ok(ParsedFeed {
                format,
                title,
                entries,
                skipped,
            })
        }
        Err(e) => salvage::salvage(source_id, format, bytes)
            .ok_or_else(|| FeederError::Parse(e.to_string())),
    }
}

/// Parse with an id generator that reports "no id" as an empty string,
/// so the fallback identity is derived by us rather than the library.
fn parse_document(bytes: &[u8]) -> Result<model::Feed, feed_rs::parser::ParseFeedError> {
    feed_rs::parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)
}

fn convert_entry(source_id: i64, entry: model::Entry) -> Option<Entry> {
    let title = entry
        .title
        .as_ref()
        .map(|t| plain_text(&t.content))
        .unwrap_or_default();

    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty());

    let guid = Some(entry.id.as_str()).filter(|id| !id.trim().is_empty());
    if guid.is_none() && link.is_none() && title.is_empty() {
        return None;
    }

    let published = entry.published.or(entry.updated);

    let snippet = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .map(|text| truncate_chars(&plain_text(&text), MAX_SNIPPET_CHARS))
        .filter(|s| !s.is_empty());

    Some(Entry::new(source_id, guid, title, link, published).with_snippet(snippet))
}

fn tag_regex() -> &'static Regex {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag pattern"))
}

/// Strip markup, decode the common entities and collapse whitespace
pub fn plain_text(html: &str) -> String {
    let stripped = tag_regex().replace_all(html, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Rust Blog</title>
    <link>https://blog.rust-lang.org/</link>
    <description>Empowering everyone to build reliable and efficient software.</description>
    <item>
      <title>Announcing Rust 1.75.0</title>
      <link>https://blog.rust-lang.org/2023/12/28/Rust-1.75.0.html</link>
      <description><![CDATA[<p>The Rust team is happy to announce a new version of Rust, 1.75.0.</p>]]></description>
      <pubDate>Thu, 28 Dec 2023 00:00:00 +0000</pubDate>
      <guid>https://blog.rust-lang.org/2023/12/28/Rust-1.75.0.html</guid>
    </item>
    <item>
      <title>Rust 2024 Call for Testing</title>
      <link>https://blog.rust-lang.org/2024/01/10/Rust-2024-CFT.html</link>
      <pubDate>Wed, 10 Jan 2024 00:00:00 +0000</pubDate>
    </item>
  </channel>
</rss>"#;

    const SAMPLE_ATOM: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Tech Blog</title>
  <link href="https://example.com/"/>
  <id>https://example.com/feed.atom</id>
  <updated>2024-01-15T12:00:00Z</updated>
  <entry>
    <title>Understanding WebAssembly</title>
    <link href="https://example.com/posts/wasm-intro"/>
    <id>https://example.com/posts/wasm-intro</id>
    <updated>2024-01-15T12:00:00Z</updated>
    <summary type="html"><![CDATA[<p>WebAssembly (Wasm) is a binary instruction format &amp; more.</p>]]></summary>
  </entry>
</feed>"#;

    const SAMPLE_JSON: &[u8] = br#"{
  "version": "https://jsonfeed.org/version/1.1",
  "title": "JSON Blog",
  "items": [
    {"id": "1", "title": "First", "url": "https://example.org/1", "content_text": "Hello"},
    {"id": "2", "title": "Second", "url": "https://example.org/2", "content_html": "<b>Bold</b> move"}
  ]
}"#;

    #[test]
    fn test_parse_rss_entries_in_document_order() {
        let parsed = parse(7, SAMPLE_RSS, Some("application/rss+xml")).unwrap();

        assert_eq!(parsed.format, FeedFormat::Rss);
        assert_eq!(parsed.title.as_deref(), Some("Rust Blog"));
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.skipped, 0);

        let first = &parsed.entries[0];
        assert_eq!(first.source_id, 7);
        assert_eq!(first.title, "Announcing Rust 1.75.0");
        assert_eq!(first.unique_id, "https://blog.rust-lang.org/2023/12/28/Rust-1.75.0.html");
        assert_eq!(
            first.snippet.as_deref(),
            Some("The Rust team is happy to announce a new version of Rust, 1.75.0.")
        );
        assert!(first.published_at.is_some());

        assert_eq!(parsed.entries[1].title, "Rust 2024 Call for Testing");
    }

    #[test]
    fn test_missing_guid_uses_content_hash() {
        let parsed = parse(1, SAMPLE_RSS, None).unwrap();
        let second = &parsed.entries[1];
        assert!(second.has_content_hash_id());
    }

    #[test]
    fn test_parse_twice_yields_identical_ids() {
        let a = parse(1, SAMPLE_RSS, None).unwrap();
        let b = parse(1, SAMPLE_RSS, None).unwrap();
        let ids_a: Vec<_> = a.entries.iter().map(|e| e.unique_id.clone()).collect();
        let ids_b: Vec<_> = b.entries.iter().map(|e| e.unique_id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_parse_atom() {
        let parsed = parse(1, SAMPLE_ATOM, Some("application/atom+xml")).unwrap();

        assert_eq!(parsed.format, FeedFormat::Atom);
        assert_eq!(parsed.entries.len(), 1);
        let entry = &parsed.entries[0];
        assert_eq!(entry.unique_id, "https://example.com/posts/wasm-intro");
        assert_eq!(entry.link.as_deref(), Some("https://example.com/posts/wasm-intro"));
        assert_eq!(
            entry.snippet.as_deref(),
            Some("WebAssembly (Wasm) is a binary instruction format & more.")
        );
    }

    #[test]
    fn test_parse_json_feed() {
        let parsed = parse(1, SAMPLE_JSON, Some("application/feed+json")).unwrap();

        assert_eq!(parsed.format, FeedFormat::JsonFeed);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].unique_id, "1");
        assert_eq!(parsed.entries[1].title, "Second");
    }

    #[test]
    fn test_generic_content_type_falls_back_to_sniffing() {
        assert_eq!(FeedFormat::detect(Some("text/xml"), SAMPLE_ATOM), Some(FeedFormat::Atom));
        assert_eq!(FeedFormat::detect(Some("text/plain"), SAMPLE_JSON), Some(FeedFormat::JsonFeed));
        assert_eq!(FeedFormat::detect(Some("application/rss+xml"), b"garbage"), Some(FeedFormat::Rss));
        assert_eq!(FeedFormat::detect(None, b"<html><body/></html>"), None);
    }

    #[test]
    fn test_detect_prefers_specific_content_type() {
        assert_eq!(
            FeedFormat::detect(Some("application/atom+xml"), SAMPLE_RSS),
            Some(FeedFormat::Atom)
        );
        assert_eq!(
            FeedFormat::detect(Some("application/xml"), SAMPLE_RSS),
            Some(FeedFormat::Rss)
        );
        assert_eq!(FeedFormat::detect(None, SAMPLE_JSON), Some(FeedFormat::JsonFeed));
    }

    #[test]
    fn test_unrecognized_document_is_error() {
        let result = parse(1, b"<html><body>nope</body></html>", Some("text/html"));
        assert!(matches!(result, Err(FeederError::Parse(_))));
    }

    #[test]
    fn test_empty_feed_is_not_error() {
        let xml = br#"<rss version="2.0"><channel><title>Empty</title></channel></rss>"#;
        let parsed = parse(1, xml, None).unwrap();
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(plain_text("<p>a &amp; b</p>\n\n<br/> c"), "a & b c");
    }

    #[test]
    fn test_long_snippet_truncated() {
        let body = "word ".repeat(200);
        let xml = format!(
            r#"<rss version="2.0"><channel><title>T</title><item><guid>x</guid><title>T</title><description>{}</description></item></channel></rss>"#,
            body
        );
        let parsed = parse(1, xml.as_bytes(), None).unwrap();
        let snippet = parsed.entries[0].snippet.as_ref().unwrap();
        assert_eq!(snippet.chars().count(), MAX_SNIPPET_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }
}
