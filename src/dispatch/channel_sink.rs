use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channels::{ChannelClient, ChannelError};
use tracing::debug;

use crate::dispatch::retry::MAX_COOLDOWN;
use crate::dispatch::sink::{Sink, SinkError};
use crate::domain::Notification;

/// Cooldown applied when the service rate limits without saying for how long
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Truncated resends after a payload-too-large reply; the last one drops
/// the text entirely
const MAX_TRUNCATION_STEPS: u32 = 4;

/// Posts notifications to a named channel on the channel service
pub struct ChannelSink {
    channel: String,
    client: Arc<ChannelClient>,
}

impl ChannelSink {
    pub fn new(channel: impl Into<String>, client: Arc<ChannelClient>) -> Self {
        Self {
            channel: channel.into(),
            client,
        }
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.client
            .send_message(&self.channel, &notification.format())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn id(&self) -> &str {
        &self.channel
    }

    /// Send the notification, halving its text while the service reports the
    /// payload as too large. At most `MAX_TRUNCATION_STEPS` resends, the
    /// last with title and link only.
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        match self.send(notification).await {
            Ok(()) => return Ok(()),
            Err(ChannelError::PayloadTooLarge) => {}
            Err(e) => return Err(map_channel_error(e)),
        }

        let mut chars = notification.text.chars().count();
        for step in 1..=MAX_TRUNCATION_STEPS {
            if chars == 0 {
                break;
            }
            chars = if step == MAX_TRUNCATION_STEPS { 0 } else { chars / 2 };
            let truncated = notification.truncated(chars);
            debug!(channel = %self.channel, chars, "Retrying with truncated text");

            match self.send(&truncated).await {
                Ok(()) => return Ok(()),
                Err(ChannelError::PayloadTooLarge) => {}
                Err(e) => return Err(map_channel_error(e)),
            }
        }

        Err(SinkError::PayloadTooLarge)
    }
}

fn map_channel_error(err: ChannelError) -> SinkError {
    match err {
        ChannelError::RateLimited { retry_after } => {
            SinkError::RateLimited(retry_after.unwrap_or(DEFAULT_COOLDOWN).min(MAX_COOLDOWN))
        }
        ChannelError::PayloadTooLarge => SinkError::PayloadTooLarge,
        e if e.is_transient() => SinkError::Transient(e.to_string()),
        e => SinkError::Permanent(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Entry;
    use crate::sources::http::test_server::{response, serve};

    const CHANNELS: &str = r#"{"channels":[{"id":7,"name":"feeds"}]}"#;
    const MESSAGE: &str = r#"{"id":1,"content":"ok","channelId":7}"#;

    fn notification(text: &str) -> Notification {
        let entry = Entry::new(
            1,
            Some("1"),
            "Title".to_string(),
            Some("https://example.com/1".to_string()),
            None,
        )
        .with_snippet(Some(text.to_string()));
        Notification::new("Blog", &entry)
    }

    async fn sink_for(responses: Vec<String>) -> (ChannelSink, crate::sources::http::test_server::TestServer) {
        let server = serve(responses).await;
        let base = server.url.trim_end_matches("/feed").to_string();
        let client = ChannelClient::new(&base, "token", Duration::from_secs(5)).unwrap();
        (ChannelSink::new("feeds", Arc::new(client)), server)
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            map_channel_error(ChannelError::RateLimited {
                retry_after: Some(Duration::from_secs(9))
            }),
            SinkError::RateLimited(Duration::from_secs(9))
        );
        assert_eq!(
            map_channel_error(ChannelError::RateLimited { retry_after: None }),
            SinkError::RateLimited(DEFAULT_COOLDOWN)
        );
        assert_eq!(
            map_channel_error(ChannelError::RateLimited {
                retry_after: Some(Duration::MAX)
            }),
            SinkError::RateLimited(MAX_COOLDOWN)
        );
        assert!(matches!(
            map_channel_error(ChannelError::Status {
                status: 502,
                body: String::new()
            }),
            SinkError::Transient(_)
        ));
        assert!(matches!(
            map_channel_error(ChannelError::Status {
                status: 403,
                body: String::new()
            }),
            SinkError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_deliver_posts_formatted_message() {
        let (sink, server) = sink_for(vec![
            response("200 OK", &[("Content-Type", "application/json")], CHANNELS),
            response("200 OK", &[("Content-Type", "application/json")], MESSAGE),
        ])
        .await;

        sink.deliver(&notification("hello")).await.unwrap();

        let requests = server.requests.lock().unwrap();
        assert!(requests[1].starts_with("POST /channels/7/messages"));
        assert!(requests[1].contains("Blog Title: hello https://example.com/1"));
    }

    #[tokio::test]
    async fn test_payload_too_large_truncates() {
        let (sink, server) = sink_for(vec![
            response("200 OK", &[("Content-Type", "application/json")], CHANNELS),
            response("413 Payload Too Large", &[], ""),
            response("413 Payload Too Large", &[], ""),
            response("200 OK", &[("Content-Type", "application/json")], MESSAGE),
        ])
        .await;

        sink.deliver(&notification("abcdefgh")).await.unwrap();

        let requests = server.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        // 8 chars, then 4, then 2
        assert!(requests[2].contains("abcd…"));
        assert!(requests[3].contains("ab…"));
    }

    #[tokio::test]
    async fn test_truncation_resends_are_bounded() {
        let mut responses = vec![response(
            "200 OK",
            &[("Content-Type", "application/json")],
            CHANNELS,
        )];
        responses.extend((0..8).map(|_| response("413 Payload Too Large", &[], "")));
        let (sink, server) = sink_for(responses).await;

        let result = sink.deliver(&notification(&"a".repeat(1000))).await;
        assert_eq!(result, Err(SinkError::PayloadTooLarge));

        let requests = server.requests.lock().unwrap();
        // Channel lookup, the original send, then 500, 250, 125 and 0 chars
        assert_eq!(requests.len(), 6);
        assert!(requests[4].contains(&format!("{}…", "a".repeat(125))));
        assert!(requests[5].contains("Blog Title https://example.com/1"));
    }

    #[tokio::test]
    async fn test_rate_limit_is_surfaced() {
        let (sink, _server) = sink_for(vec![
            response("200 OK", &[("Content-Type", "application/json")], CHANNELS),
            response("429 Too Many Requests", &[("Retry-After", "3")], ""),
        ])
        .await;

        let result = sink.deliver(&notification("hello")).await;
        assert_eq!(result, Err(SinkError::RateLimited(Duration::from_secs(3))));
    }
}
