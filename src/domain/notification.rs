use super::{Entry, FeedSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub source_title: String,
    pub entry_title: String,
    pub text: String,
    pub link: Option<String>,
}

impl Notification {
    pub fn from_entry(source: &FeedSource, entry: &Entry) -> Self {
        Self::new(source.display_name(), entry)
    }

    pub fn new(source_title: &str, entry: &Entry) -> Self {
        Self {
            source_title: source_title.to_string(),
            entry_title: entry.title.clone(),
            text: entry.snippet.clone().unwrap_or_default(),
            link: entry.link.clone(),
        }
    }

    /// Format: "{sourceTitle} {entryTitle}: {text} {link (if any)}"
    pub fn format(&self) -> String {
        let mut message = format!("{} {}", self.source_title, self.entry_title);

        if !self.text.is_empty() {
            message.push_str(": ");
            message.push_str(&self.text);
        }

        if let Some(link) = &self.link {
            message.push(' ');
            message.push_str(link);
        }

        message
    }

    /// Copy with the text cut to at most `max_chars` characters
    pub fn truncated(&self, max_chars: usize) -> Self {
        let mut copy = self.clone();
        if copy.text.chars().count() > max_chars {
            copy.text = copy.text.chars().take(max_chars).collect();
            if max_chars > 0 {
                copy.text.push('…');
            }
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_format_with_all_fields() {
        let notification = Notification {
            source_title: "Tech Blog".to_string(),
            entry_title: "New Rust Features".to_string(),
            text: "Rust 1.75 introduces async traits".to_string(),
            link: Some("https://example.com/post".to_string()),
        };

        assert_eq!(
            notification.format(),
            "Tech Blog New Rust Features: Rust 1.75 introduces async traits https://example.com/post"
        );
    }

    #[test]
    fn test_notification_format_without_link() {
        let notification = Notification {
            source_title: "Blog".to_string(),
            entry_title: "Title".to_string(),
            text: "Content".to_string(),
            link: None,
        };

        assert_eq!(notification.format(), "Blog Title: Content");
    }

    #[test]
    fn test_notification_format_without_text() {
        let notification = Notification {
            source_title: "Blog".to_string(),
            entry_title: "Title".to_string(),
            text: String::new(),
            link: Some("https://example.com".to_string()),
        };

        assert_eq!(notification.format(), "Blog Title https://example.com");
    }

    #[test]
    fn test_notification_from_entry() {
        let entry = Entry::new(
            1,
            Some("123"),
            "Test Entry".to_string(),
            Some("https://example.com/entry".to_string()),
            None,
        )
        .with_snippet(Some("Entry content".to_string()));

        let notification = Notification::new("Example Feed", &entry);

        assert_eq!(notification.source_title, "Example Feed");
        assert_eq!(notification.entry_title, "Test Entry");
        assert_eq!(notification.text, "Entry content");
        assert_eq!(notification.link.as_deref(), Some("https://example.com/entry"));
    }

    #[test]
    fn test_truncated_respects_char_boundaries() {
        let notification = Notification {
            source_title: "Blog".to_string(),
            entry_title: "Title".to_string(),
            text: "héllo wörld".to_string(),
            link: None,
        };

        assert_eq!(notification.truncated(5).text, "héllo…");
        assert_eq!(notification.truncated(0).text, "");
        assert_eq!(notification.truncated(100).text, "héllo wörld");
    }
}
