use rusqlite::OptionalExtension;

use crate::domain::{DeliveryRecord, DeliveryStatus, DeliverySummary};
use crate::errors::{FeederError, FeederResult};
use crate::storage::sqlite::connection::{from_db_time, to_db_time};
use crate::storage::sqlite::SqliteStorage;
use crate::storage::traits::DeliveryRepository;

pub struct SqliteDeliveryRepository {
    storage: SqliteStorage,
}

impl SqliteDeliveryRepository {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }
}

impl DeliveryRepository for SqliteDeliveryRepository {
    fn record_delivery(&self, record: &DeliveryRecord) -> FeederResult<bool> {
        let conn = self.storage.connection()?;
        // The WHERE on the upsert keeps a delivered row frozen, so two
        // workers racing on the same pair cannot downgrade or rewrite it.
        let written = conn.execute(
            "INSERT INTO deliveries (entry_id, sink_id, status, attempts, last_error, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (entry_id, sink_id) DO UPDATE SET \
                 status = excluded.status, \
                 attempts = excluded.attempts, \
                 last_error = excluded.last_error, \
                 delivered_at = excluded.delivered_at \
             WHERE deliveries.status <> 'delivered'",
            (
                record.entry_id,
                &record.sink_id,
                record.status.as_str(),
                record.attempts as i64,
                &record.last_error,
                to_db_time(record.delivered_at),
            ),
        )?;
        Ok(written > 0)
    }

    fn has_delivered(&self, entry_id: i64, sink_id: &str) -> FeederResult<bool> {
        let conn = self.storage.connection()?;
        let mut stmt = conn.prepare(
            "SELECT EXISTS(SELECT 1 FROM deliveries \
             WHERE entry_id = ?1 AND sink_id = ?2 AND status = 'delivered')",
        )?;
        let delivered: bool = stmt.query_row((entry_id, sink_id), |row| row.get(0))?;
        Ok(delivered)
    }

    fn get(&self, entry_id: i64, sink_id: &str) -> FeederResult<Option<DeliveryRecord>> {
        let conn = self.storage.connection()?;
        let row = conn
            .query_row(
                "SELECT entry_id, sink_id, status, attempts, last_error, delivered_at \
                 FROM deliveries WHERE entry_id = ?1 AND sink_id = ?2",
                (entry_id, sink_id),
                |row| {
                    let status: String = row.get(2)?;
                    let attempts: i64 = row.get(3)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        status,
                        attempts,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((entry_id, sink_id, status, attempts, last_error, delivered_at)) = row else {
            return Ok(None);
        };

        let status: DeliveryStatus = status.parse().map_err(FeederError::Persistence)?;
        Ok(Some(DeliveryRecord {
            entry_id,
            sink_id,
            status,
            attempts: attempts.max(0) as u32,
            last_error,
            delivered_at: from_db_time(delivered_at)
                .ok_or_else(|| FeederError::Persistence("bad delivered_at timestamp".into()))?,
        }))
    }

    fn summary(&self) -> FeederResult<Vec<DeliverySummary>> {
        let conn = self.storage.connection()?;
        let mut stmt = conn.prepare(
            "SELECT sink_id, \
                    SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) \
             FROM deliveries GROUP BY sink_id ORDER BY sink_id",
        )?;

        let rows = stmt.query_map([], |row| {
            let delivered: i64 = row.get(1)?;
            let failed: i64 = row.get(2)?;
            Ok(DeliverySummary {
                sink_id: row.get(0)?,
                delivered: delivered.max(0) as u64,
                failed: failed.max(0) as u64,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(FeederError::from)
    }
}
