use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::domain::{CacheToken, FeedSource, NewFeedSource};
use crate::errors::{FeederError, FeederResult};
use crate::storage::sqlite::connection::{from_db_time, to_db_time};
use crate::storage::sqlite::SqliteStorage;
use crate::storage::traits::SourceRepository;

const SOURCE_COLUMNS: &str = "id, url, title, interval_secs, last_token, last_fetched_at, \
     failure_count, last_error, disabled, created_at";

pub struct SqliteSourceRepository {
    storage: SqliteStorage,
}

impl SqliteSourceRepository {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }
}

fn map_source(row: &Row<'_>) -> rusqlite::Result<FeedSource> {
    let interval: Option<i64> = row.get(3)?;
    let failures: i64 = row.get(6)?;
    Ok(FeedSource {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        interval_secs: interval.map(|v| v.max(0) as u64),
        cache_token: CacheToken::from_column(row.get(4)?),
        last_fetched_at: from_db_time(row.get(5)?),
        failure_count: failures.max(0) as u32,
        last_error: row.get(7)?,
        disabled: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub(crate) fn load_source(conn: &Connection, id: i64) -> FeederResult<Option<FeedSource>> {
    let sql = format!("SELECT {} FROM feed_sources WHERE id = ?1", SOURCE_COLUMNS);
    conn.query_row(&sql, [id], map_source)
        .optional()
        .map_err(FeederError::from)
}

/// Write the poll state of a source. The disabled flag is left alone so a
/// `remove` issued mid-poll sticks.
pub(crate) fn write_source_state(conn: &Connection, source: &FeedSource) -> FeederResult<()> {
    let changed = conn.execute(
        "UPDATE feed_sources SET title = ?2, last_token = ?3, last_fetched_at = ?4, \
         failure_count = ?5, last_error = ?6 WHERE id = ?1",
        (
            source.id,
            &source.title,
            source.cache_token.to_column(),
            source.last_fetched_at.map(to_db_time),
            source.failure_count as i64,
            &source.last_error,
        ),
    )?;
    if changed == 0 {
        return Err(FeederError::SourceNotFound(source.id.to_string()));
    }
    Ok(())
}

impl SourceRepository for SqliteSourceRepository {
    fn add(&self, source: &NewFeedSource) -> FeederResult<i64> {
        let mut conn = self.storage.connection()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM feed_sources WHERE url = ?1)",
            [&source.url],
            |row| row.get(0),
        )?;
        if exists {
            return Err(FeederError::SourceAlreadyExists(source.url.clone()));
        }

        tx.execute(
            "INSERT INTO feed_sources (url, title, interval_secs) VALUES (?1, ?2, ?3)",
            (
                &source.url,
                &source.title,
                source.interval_secs.map(|v| v as i64),
            ),
        )?;
        let id = tx.last_insert_rowid();

        for sink in &source.sinks {
            tx.execute(
                "INSERT OR IGNORE INTO source_sinks (source_id, sink_id) VALUES (?1, ?2)",
                (id, sink),
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    fn get_by_id(&self, id: i64) -> FeederResult<Option<FeedSource>> {
        let conn = self.storage.connection()?;
        load_source(&conn, id)
    }

    fn get_by_url(&self, url: &str) -> FeederResult<Option<FeedSource>> {
        let conn = self.storage.connection()?;
        let sql = format!("SELECT {} FROM feed_sources WHERE url = ?1", SOURCE_COLUMNS);
        conn.query_row(&sql, [url], map_source)
            .optional()
            .map_err(FeederError::from)
    }

    fn get_all(&self) -> FeederResult<Vec<FeedSource>> {
        let conn = self.storage.connection()?;
        let sql = format!("SELECT {} FROM feed_sources ORDER BY id", SOURCE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let sources = stmt.query_map([], map_source)?;
        sources.collect::<Result<Vec<_>, _>>().map_err(FeederError::from)
    }

    fn list_enabled(&self) -> FeederResult<Vec<FeedSource>> {
        let conn = self.storage.connection()?;
        let sql = format!(
            "SELECT {} FROM feed_sources WHERE disabled = 0 ORDER BY id",
            SOURCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let sources = stmt.query_map([], map_source)?;
        sources.collect::<Result<Vec<_>, _>>().map_err(FeederError::from)
    }

    fn exists(&self, url: &str) -> FeederResult<bool> {
        let conn = self.storage.connection()?;
        let mut stmt = conn.prepare("SELECT EXISTS(SELECT 1 FROM feed_sources WHERE url = ?1)")?;
        let exists: bool = stmt.query_row([url], |row| row.get(0))?;
        Ok(exists)
    }

    fn set_disabled(&self, id: i64, disabled: bool) -> FeederResult<()> {
        let conn = self.storage.connection()?;
        let changed = if disabled {
            conn.execute("UPDATE feed_sources SET disabled = 1 WHERE id = ?1", [id])?
        } else {
            conn.execute(
                "UPDATE feed_sources SET disabled = 0, failure_count = 0, last_error = NULL WHERE id = ?1",
                [id],
            )?
        };
        if changed == 0 {
            return Err(FeederError::SourceNotFound(id.to_string()));
        }
        Ok(())
    }

    fn update_source_state(&self, source: &FeedSource) -> FeederResult<()> {
        let conn = self.storage.connection()?;
        write_source_state(&conn, source)
    }

    fn record_not_modified(&self, id: i64, at: DateTime<Utc>) -> FeederResult<()> {
        let conn = self.storage.connection()?;
        let changed = conn.execute(
            "UPDATE feed_sources SET last_fetched_at = ?2 WHERE id = ?1",
            (id, to_db_time(at)),
        )?;
        if changed == 0 {
            return Err(FeederError::SourceNotFound(id.to_string()));
        }
        Ok(())
    }

    fn record_failure(&self, id: i64, error: &str, threshold: u32) -> FeederResult<FeedSource> {
        let mut conn = self.storage.connection()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE feed_sources SET failure_count = failure_count + 1, last_error = ?2, \
             disabled = CASE WHEN failure_count + 1 >= ?3 THEN 1 ELSE disabled END \
             WHERE id = ?1",
            (id, error, threshold.max(1) as i64),
        )?;
        if changed == 0 {
            return Err(FeederError::SourceNotFound(id.to_string()));
        }

        let source = load_source(&tx, id)?
            .ok_or_else(|| FeederError::SourceNotFound(id.to_string()))?;
        tx.commit()?;
        Ok(source)
    }

    fn sinks_for(&self, id: i64) -> FeederResult<Vec<String>> {
        let conn = self.storage.connection()?;
        let mut stmt =
            conn.prepare("SELECT sink_id FROM source_sinks WHERE source_id = ?1 ORDER BY sink_id")?;
        let sinks = stmt.query_map([id], |row| row.get(0))?;
        sinks.collect::<Result<Vec<_>, _>>().map_err(FeederError::from)
    }
}
