pub mod discovery;
pub mod http;
pub mod traits;

pub use discovery::{discover, DiscoveredFeed};
pub use http::{HttpFetcher, MAX_FEED_SIZE};
pub use traits::{FeedFetcher, FetchOutcome};
