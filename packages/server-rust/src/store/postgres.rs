//! [`RecordSource`] backed by the storage bucket's `PostgreSQL` table.
//!
//! Each bucket row carries the store-assigned `_id`, the JSON-encoded record
//! in `_value`, and indexed copies of the filterable fields. A window
//! `COUNT(*) OVER ()` reports the total match count alongside each page, the
//! same contract the bucket's find API offers.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use storinfo_core::StorageNodeRecord;
use tracing::debug;

use super::{FindPage, FindQuery, RecordSource, StoredRecord, STORAGE_BUCKET};

/// Connection settings for [`PostgresRecordSource`].
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// `postgres://` connection string.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
}

/// Reads storage node records straight from the bucket table.
pub struct PostgresRecordSource {
    pool: PgPool,
    url_host: String,
}

impl PostgresRecordSource {
    /// Connects to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self {
            pool,
            url_host: redact(&config.url),
        })
    }

    fn find_sql() -> String {
        format!(
            "SELECT _id, _value, COUNT(*) OVER () AS _count \
             FROM {STORAGE_BUCKET} \
             WHERE percentused::float8 <= $1 \
               AND timestamp::int8 >= $2 \
               AND _id >= $3 \
             ORDER BY _id ASC \
             LIMIT $4"
        )
    }
}

#[async_trait]
impl RecordSource for PostgresRecordSource {
    async fn find_page(&self, query: &FindQuery) -> anyhow::Result<FindPage> {
        let min_timestamp = i64::try_from(query.min_timestamp)?;
        // The first page has no marker; every internal id is >= 0.
        let marker = i64::try_from(query.marker.unwrap_or(0))?;
        let limit = i64::try_from(query.limit)?;

        let rows = sqlx::query(&Self::find_sql())
            .bind(query.max_percent_used)
            .bind(min_timestamp)
            .bind(marker)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut total = 0u64;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let internal_id: i64 = row.try_get("_id")?;
            let value: String = row.try_get("_value")?;
            let count: i64 = row.try_get("_count")?;
            total = u64::try_from(count)?;

            let record: StorageNodeRecord = serde_json::from_str(&value)
                .map_err(|e| anyhow::anyhow!("bucket row {internal_id} is not a storage record: {e}"))?;
            records.push(StoredRecord {
                internal_id: u64::try_from(internal_id)?,
                record,
            });
        }

        debug!(returned = records.len(), total, marker = ?query.marker, "bucket page fetched");
        Ok(FindPage { records, total })
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("postgres bucket {STORAGE_BUCKET} at {}", self.url_host)
    }
}

/// Strips credentials from a connection string for logging.
fn redact(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => host.to_string(),
        None => url.to_string(),
    }
}
