use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Notification;

/// How a single delivery call failed, as far as retrying is concerned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("payload too large")]
    PayloadTooLarge,
}

/// A destination that accepts notifications
#[async_trait]
pub trait Sink: Send + Sync {
    fn id(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}
