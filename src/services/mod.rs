pub mod feed_service;
pub mod import_export_service;
pub mod poll_service;
pub mod recovery;

pub use feed_service::{FeedService, StatusReport};
pub use import_export_service::{ImportExportService, ImportResult};
pub use poll_service::{PollService, PollSettings};
pub use recovery::{requeue_undelivered, RECOVERY_LIMIT};
