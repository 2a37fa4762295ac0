use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeederError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Source errors
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("Feed validation failed: {0}")]
    FeedValidation(String),

    #[error("Feed source not found: {0}")]
    SourceNotFound(String),

    #[error("Feed source already exists: {0}")]
    SourceAlreadyExists(String),

    // Network errors
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("HTTP error {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // Parsing errors
    #[error("Feed parsing failed: {0}")]
    Parse(String),

    #[error("OPML parsing failed: {0}")]
    OpmlParse(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // Delivery errors
    #[error("Sink {sink} is rate limited for {cooldown:?}")]
    RateLimited { sink: String, cooldown: Duration },

    #[error("Delivery to {sink} failed permanently: {reason}")]
    PermanentDelivery { sink: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // User input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Channel errors from the channels library
    #[error("Channel error: {0}")]
    Channel(String),
}

impl FeederError {
    /// Whether the same operation may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            FeederError::TransientNetwork(_)
            | FeederError::Timeout(_)
            | FeederError::RateLimited { .. } => true,
            FeederError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            FeederError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

impl From<channels::ChannelError> for FeederError {
    fn from(err: channels::ChannelError) -> Self {
        FeederError::Channel(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FeederError {
    fn from(err: tokio::task::JoinError) -> Self {
        FeederError::Persistence(format!("store task failed: {}", err))
    }
}

pub type FeederResult<T> = Result<T, FeederError>;
