//! Item-by-item recovery for documents that fail to parse as a whole.

use std::sync::OnceLock;

use regex::Regex;

use super::{convert_entry, parse_document, FeedFormat, ParsedFeed};

const RSS2_ROOT: &str = r#"<rss version="2.0">"#;
const ATOM_ROOT: &str = r#"<feed xmlns="http://www.w3.org/2005/Atom">"#;

fn rss_items() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<item[\s>].*?</item>").expect("valid item pattern"))
}

fn atom_entries() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<entry[\s>].*?</entry>").expect("valid entry pattern"))
}

fn root_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<(rss|rdf:RDF|feed)\b[^>]*>").expect("valid root pattern")
    })
}

/// Recover what we can from a broken document.
///
/// Returns `None` when no item could be located at all.
pub(super) fn salvage(source_id: i64, format: FeedFormat, bytes: &[u8]) -> Option<ParsedFeed> {
    let documents = match format {
        FeedFormat::Rss | FeedFormat::Atom => xml_item_documents(format, bytes),
        FeedFormat::JsonFeed => json_item_documents(bytes),
    };
    if documents.is_empty() {
        return None;
    }

    let mut entries = Vec::new();
    let mut skipped = 0;
    for document in documents {
        let entry = parse_document(document.as_bytes())
            .ok()
            .and_then(|feed| feed.entries.into_iter().next())
            .and_then(|entry| convert_entry(source_id, entry));
        match entry {
            Some(entry) => entries.push(entry),
            None => skipped += 1,
        }
    }

    if entries.is_empty() {
        return None;
    }

    Some(ParsedFeed {
        format,
        title: None,
        entries,
        skipped,
    })
}

/// Wrap each item of an XML feed in a minimal envelope of its own.
/// The original root tag is reused so namespace declarations carry over.
fn xml_item_documents(format: FeedFormat, bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let root = root_tag().captures(&text);

    let (items, open, close) = match format {
        FeedFormat::Atom => {
            let open = root
                .as_ref()
                .filter(|c| &c[1] == "feed")
                .map(|c| c[0].to_string())
                .unwrap_or_else(|| ATOM_ROOT.to_string());
            (
                atom_entries(),
                format!("{}<title>salvaged</title>", open),
                "</feed>".to_string(),
            )
        }
        _ => match root.as_ref().map(|c| (c[0].to_string(), c[1].to_string())) {
            Some((tag, name)) if name == "rdf:RDF" => (
                rss_items(),
                format!(
                    "{}<channel rdf:about=\"\"><title>salvaged</title><link>about:blank</link><description/></channel>",
                    tag
                ),
                "</rdf:RDF>".to_string(),
            ),
            Some((tag, name)) if name == "rss" => (
                rss_items(),
                format!("{}<channel><title>salvaged</title>", tag),
                "</channel></rss>".to_string(),
            ),
            _ => (
                rss_items(),
                format!("{}<channel><title>salvaged</title>", RSS2_ROOT),
                "</channel></rss>".to_string(),
            ),
        },
    };

    items
        .find_iter(&text)
        .map(|m| format!("{}{}{}", open, m.as_str(), close))
        .collect()
}

/// Split a JSON Feed into one single-item feed per element of `items`
fn json_item_documents(bytes: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return Vec::new();
    };
    let version = value
        .get("version")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::from("https://jsonfeed.org/version/1.1"));
    let Some(items) = value.get("items").and_then(|i| i.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| {
            serde_json::json!({
                "version": version,
                "title": "salvaged",
                "items": [item],
            })
            .to_string()
        })
        .collect()
}
