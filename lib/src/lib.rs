//! Channel messaging bindings for Rust
//! Provides async functions to list channels and send messages by channel name,
//! surfacing the service's rate-limit and payload-size signals as typed errors.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),
    #[error("Invalid header value")]
    InvalidHeader,
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

impl ChannelError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::RequestError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ChannelError::RateLimited { .. } | ChannelError::ChannelNotFound(_) => true,
            ChannelError::Status { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    channels: Vec<Channel>,
}

fn deserialize_string_or_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrI64Visitor;

    impl<'de> Visitor<'de> for StringOrI64Visitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or i64")
        }

        fn visit_i64<E>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E>(self, v: u64) -> Result<i64, E> {
            Ok(v as i64)
        }

        fn visit_str<E>(self, v: &str) -> Result<i64, E>
        where
            E: de::Error,
        {
            v.parse().map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(StringOrI64Visitor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "deserialize_string_or_i64")]
    pub id: i64,
    pub content: String,
    #[serde(alias = "channelId", alias = "channel_id", deserialize_with = "deserialize_string_or_i64")]
    pub channel_id: i64,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateChannelPayload<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

/// Longest wait a `Retry-After` value can ask for
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parse a `Retry-After` value given in (possibly fractional) seconds,
/// capped at `MAX_RETRY_AFTER`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    let wait = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER);
    Some(wait.min(MAX_RETRY_AFTER))
}

pub struct ChannelClient {
    url: String,
    client: Client,
    channel_ids: Mutex<HashMap<String, i64>>,
}

impl ChannelClient {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, ChannelError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(token).map_err(|_| ChannelError::InvalidHeader)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            channel_ids: Mutex::new(HashMap::new()),
        })
    }

    /// List all available channels
    pub async fn list_channels(&self) -> Result<Vec<Channel>, ChannelError> {
        let response = self
            .client
            .get(format!("{}/channels", self.url))
            .send()
            .await?;
        let response = check_status(response).await?;

        let wrapper: ChannelsResponse = response.json().await?;
        Ok(wrapper.channels)
    }

    /// Find a channel ID by its name
    pub async fn find_channel_id_by_name(&self, name: &str) -> Result<Option<i64>, ChannelError> {
        if let Some(id) = self.cached_id(name) {
            return Ok(Some(id));
        }

        let channels = self.list_channels().await?;
        let found = channels.into_iter().find(|c| c.name == name).map(|c| c.id);
        if let Some(id) = found {
            self.cache_id(name, id);
        }
        Ok(found)
    }

    /// Create a new channel
    pub async fn create_channel(&self, name: &str) -> Result<Channel, ChannelError> {
        let response = self
            .client
            .post(format!("{}/channels/", self.url))
            .json(&CreateChannelPayload { name })
            .send()
            .await?;
        let response = check_status(response).await?;

        let channel: Channel = response.json().await?;
        self.cache_id(&channel.name, channel.id);
        Ok(channel)
    }

    /// Send a message to a channel by name, creating the channel if it doesn't exist
    pub async fn send_message(&self, channel_name: &str, content: &str) -> Result<Message, ChannelError> {
        let channel_id = match self.find_channel_id_by_name(channel_name).await? {
            Some(id) => id,
            None => self.create_channel(channel_name).await?.id,
        };

        let response = self
            .client
            .post(format!("{}/channels/{}/messages", self.url, channel_id))
            .json(&SendMessagePayload { content })
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            // Channel was deleted behind our back
            self.forget_id(channel_name);
            return Err(ChannelError::ChannelNotFound(channel_name.to_string()));
        }

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    fn cached_id(&self, name: &str) -> Option<i64> {
        self.channel_ids.lock().ok()?.get(name).copied()
    }

    fn cache_id(&self, name: &str, id: i64) {
        if let Ok(mut ids) = self.channel_ids.lock() {
            ids.insert(name.to_string(), id);
        }
    }

    fn forget_id(&self, name: &str) {
        if let Ok(mut ids) = self.channel_ids.lock() {
            ids.remove(name);
        }
    }
}

/// Map non-success statuses onto typed errors
async fn check_status(response: Response) -> Result<Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::PAYLOAD_TOO_LARGE => Err(ChannelError::PayloadTooLarge),
        StatusCode::TOO_MANY_REQUESTS => {
            let header = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let retry_after = match header {
                Some(d) => Some(d),
                None => response
                    .json::<RateLimitBody>()
                    .await
                    .ok()
                    .and_then(|b| b.retry_after)
                    .and_then(|s| parse_retry_after(&s.to_string())),
            };
            Err(ChannelError::RateLimited { retry_after })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(ChannelError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
