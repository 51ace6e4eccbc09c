//! The append-only ordered alert log (`alert_messages` table).

use crate::types::AlertRow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{AnyPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no row for sequence {0}")]
    NotFound(u32),

    #[error("sequence {0} already exists")]
    SequenceConflict(u32),

    #[error("datastore error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert a new row. `SequenceConflict` if `row.sequence` already exists.
    async fn append(&self, row: &AlertRow) -> Result<(), StoreError>;

    async fn get_by_sequence(&self, sequence: u32) -> Result<AlertRow, StoreError>;

    /// The row with the maximum sequence. `NotFound` only before genesis.
    async fn latest(&self) -> Result<AlertRow, StoreError>;

    /// All rows with `processed = false`, ascending by sequence.
    async fn all_unprocessed(&self) -> Result<Vec<AlertRow>, StoreError>;

    async fn mark_processed(&self, id: i64, processed: bool) -> Result<(), StoreError>;
}

/// `sqlx::Any` has no `Decode`/`Type` impl for `chrono` types, so timestamp
/// columns come back through the row as `TEXT` and are parsed here instead.
/// SQLite's `CURRENT_TIMESTAMP` default renders as `YYYY-MM-DD HH:MM:SS`;
/// fall back to RFC 3339 for other backends, and to "now" if neither parses
/// rather than failing a read over a column the spec never needs back out.
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Utc.from_utc_datetime(&naive);
    }
    if let Ok(dt) = raw.parse::<DateTime<Utc>>() {
        return dt;
    }
    Utc::now()
}

/// SQL-backed implementation shared across SQLite/Postgres/MySQL via
/// `sqlx::Any`, following the "SQLite / Postgres / MySQL" pool
/// contract.
pub struct SqlAlertStore {
    pool: AnyPool,
    table: String,
}

impl SqlAlertStore {
    pub fn new(pool: AnyPool, table_prefix: &str) -> Self {
        Self {
            pool,
            table: format!("{table_prefix}alert_messages"),
        }
    }

    fn row_from(&self, row: &sqlx::any::AnyRow) -> Result<AlertRow, StoreError> {
        Ok(AlertRow {
            id: row.try_get("id")?,
            sequence: row.try_get::<i64, _>("sequence")? as u32,
            hash: row.try_get("hash")?,
            raw: row.try_get("raw")?,
            processed: row.try_get("processed")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?),
            deleted_at: row
                .try_get::<Option<String>, _>("deleted_at")?
                .as_deref()
                .map(parse_timestamp),
        })
    }
}

#[async_trait]
impl AlertStore for SqlAlertStore {
    async fn append(&self, row: &AlertRow) -> Result<(), StoreError> {
        let query = format!(
            "INSERT INTO {} (sequence, hash, raw, processed) VALUES ($1, $2, $3, $4)",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(row.sequence as i64)
            .bind(&row.hash)
            .bind(&row.raw)
            .bind(row.processed)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::SequenceConflict(row.sequence))
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn get_by_sequence(&self, sequence: u32) -> Result<AlertRow, StoreError> {
        let query = format!(
            "SELECT * FROM {} WHERE sequence = $1 AND deleted_at IS NULL",
            self.table
        );
        let row = sqlx::query(&query)
            .bind(sequence as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => self.row_from(&r),
            None => Err(StoreError::NotFound(sequence)),
        }
    }

    async fn latest(&self) -> Result<AlertRow, StoreError> {
        let query = format!(
            "SELECT * FROM {} WHERE deleted_at IS NULL ORDER BY sequence DESC LIMIT 1",
            self.table
        );
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(r) => self.row_from(&r),
            None => Err(StoreError::NotFound(0)),
        }
    }

    async fn all_unprocessed(&self) -> Result<Vec<AlertRow>, StoreError> {
        let query = format!(
            "SELECT * FROM {} WHERE processed = false AND deleted_at IS NULL ORDER BY sequence ASC",
            self.table
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.row_from(r)).collect()
    }

    async fn mark_processed(&self, id: i64, processed: bool) -> Result<(), StoreError> {
        let query = format!("UPDATE {} SET processed = $1 WHERE id = $2", self.table);
        sqlx::query(&query)
            .bind(processed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
