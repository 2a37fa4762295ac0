use rusqlite::Connection;

use crate::domain::{Entry, FeedSource, StoredEntry};
use crate::errors::{FeederError, FeederResult};
use crate::storage::sqlite::connection::{from_db_time, to_db_time};
use crate::storage::sqlite::source_repository::write_source_state;
use crate::storage::sqlite::SqliteStorage;
use crate::storage::traits::{EntryRepository, PendingEntry};

pub struct SqliteEntryRepository {
    storage: SqliteStorage,
}

impl SqliteEntryRepository {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }
}

/// Insert each entry unless its (source, key) pair is already stored.
/// Returns only the rows that were actually inserted.
fn insert_new(conn: &Connection, entries: &[Entry]) -> FeederResult<Vec<StoredEntry>> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO entries (source_id, unique_key, title, link, published_at, snippet) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;

    let mut stored = Vec::new();
    for entry in entries {
        let inserted = stmt.execute((
            entry.source_id,
            &entry.unique_id,
            &entry.title,
            &entry.link,
            entry.published_at.map(to_db_time),
            &entry.snippet,
        ))?;
        if inserted > 0 {
            stored.push(StoredEntry {
                id: conn.last_insert_rowid(),
                entry: entry.clone(),
            });
        }
    }
    Ok(stored)
}

impl EntryRepository for SqliteEntryRepository {
    fn save_entries(&self, entries: &[Entry]) -> FeederResult<Vec<StoredEntry>> {
        let mut conn = self.storage.connection()?;
        let tx = conn.transaction()?;
        let stored = insert_new(&tx, entries)?;
        tx.commit()?;
        Ok(stored)
    }

    fn commit_poll(&self, source: &FeedSource, entries: &[Entry]) -> FeederResult<Vec<StoredEntry>> {
        let mut conn = self.storage.connection()?;
        let tx = conn.transaction()?;
        let stored = insert_new(&tx, entries)?;
        write_source_state(&tx, source)?;
        tx.commit()?;
        Ok(stored)
    }

    fn known_keys(&self, source_id: i64, keys: &[String]) -> FeederResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.storage.connection()?;

        // ?1 is the source, keys start at ?2
        let placeholders: Vec<String> = (0..keys.len()).map(|i| format!("?{}", i + 2)).collect();
        let query = format!(
            "SELECT unique_key FROM entries WHERE source_id = ?1 AND unique_key IN ({})",
            placeholders.join(", ")
        );

        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(keys.len() + 1);
        params.push(&source_id);
        params.extend(keys.iter().map(|k| k as &dyn rusqlite::ToSql));

        let mut stmt = conn.prepare(&query)?;
        let known = stmt.query_map(params.as_slice(), |row| row.get(0))?;
        known.collect::<Result<Vec<_>, _>>().map_err(FeederError::from)
    }

    fn undelivered_for_sink(&self, sink_id: &str, limit: usize) -> FeederResult<Vec<PendingEntry>> {
        let conn = self.storage.connection()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.source_id, e.unique_key, e.title, e.link, e.published_at, e.snippet, \
                    CASE WHEN s.title = '' THEN s.url ELSE s.title END \
             FROM entries e \
             JOIN feed_sources s ON s.id = e.source_id \
             WHERE NOT EXISTS ( \
                     SELECT 1 FROM deliveries d WHERE d.entry_id = e.id AND d.sink_id = ?1) \
               AND ( \
                     NOT EXISTS (SELECT 1 FROM source_sinks r WHERE r.source_id = e.source_id) \
                     OR EXISTS (SELECT 1 FROM source_sinks r \
                                WHERE r.source_id = e.source_id AND r.sink_id = ?1)) \
             ORDER BY e.id \
             LIMIT ?2",
        )?;

        let pending = stmt.query_map((sink_id, limit as i64), |row| {
            Ok(PendingEntry {
                entry: StoredEntry {
                    id: row.get(0)?,
                    entry: Entry {
                        source_id: row.get(1)?,
                        unique_id: row.get(2)?,
                        title: row.get(3)?,
                        link: row.get(4)?,
                        published_at: from_db_time(row.get(5)?),
                        snippet: row.get(6)?,
                    },
                },
                source_title: row.get(7)?,
            })
        })?;

        pending.collect::<Result<Vec<_>, _>>().map_err(FeederError::from)
    }
}
