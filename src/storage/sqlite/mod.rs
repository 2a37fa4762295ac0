mod connection;
mod delivery_repository;
mod entry_repository;
mod source_repository;

pub use connection::SqliteStorage;
pub use delivery_repository::SqliteDeliveryRepository;
pub use entry_repository::SqliteEntryRepository;
pub use source_repository::SqliteSourceRepository;
