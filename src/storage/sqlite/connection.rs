use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::errors::{FeederError, FeederResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feed_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL DEFAULT '',
    interval_secs INTEGER,
    last_token TEXT,
    last_fetched_at TEXT,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    disabled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS source_sinks (
    source_id INTEGER NOT NULL,
    sink_id TEXT NOT NULL,
    PRIMARY KEY (source_id, sink_id),
    FOREIGN KEY (source_id) REFERENCES feed_sources(id)
);

CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    unique_key TEXT NOT NULL,
    title TEXT NOT NULL,
    link TEXT,
    published_at TEXT,
    snippet TEXT,
    discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (source_id, unique_key),
    FOREIGN KEY (source_id) REFERENCES feed_sources(id)
);

CREATE TABLE IF NOT EXISTS deliveries (
    entry_id INTEGER NOT NULL,
    sink_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    delivered_at TEXT NOT NULL,
    PRIMARY KEY (entry_id, sink_id),
    FOREIGN KEY (entry_id) REFERENCES entries(id)
);

CREATE INDEX IF NOT EXISTS idx_deliveries_sink ON deliveries(sink_id, status);
"#;

#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> FeederResult<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        // WAL lets status queries run while the daemon writes
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> FeederResult<Self> {
        debug!("Opening in-memory database");
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> FeederResult<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let _: i64 = conn.query_row("PRAGMA busy_timeout = 5000", [], |row| row.get(0))?;
        Ok(())
    }

    pub fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, FeederError> {
        self.conn
            .lock()
            .map_err(|_| FeederError::Persistence("connection lock poisoned".to_string()))
    }
}

pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn from_db_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_in_memory_storage() {
        let storage = SqliteStorage::in_memory().unwrap();
        let conn = storage.connection().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in ["deliveries", "entries", "feed_sources", "source_sinks"] {
            assert!(tables.iter().any(|t| t == table), "missing table {}", table);
        }
    }

    #[test]
    fn test_file_storage_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("feeder.db");
        SqliteStorage::new(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_db_time_round_trip() {
        let now = Utc::now();
        let parsed = from_db_time(Some(to_db_time(now))).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
        assert_eq!(from_db_time(Some("garbage".to_string())), None);
    }
}
