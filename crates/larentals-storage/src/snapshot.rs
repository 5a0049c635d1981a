use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use larentals_core::{Listing, ListingReport, Segment};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot table `{table}` is corrupt: {reason}")]
    Corrupt { table: String, reason: String },
    #[error("snapshot database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to serialize listing {listing_id}: {source}")]
    Serialize {
        listing_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted per-segment table of listings, replaced wholesale on each run.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Current snapshot for `segment`; empty when nothing was written yet.
    async fn read_snapshot(&self, segment: Segment) -> Result<Vec<Listing>, StoreError>;

    /// Replaces the snapshot for `segment`. Readers see either the old or the new table.
    async fn write_snapshot(&self, segment: Segment, listings: &[Listing]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
    table_suffix: Option<String>,
}

impl SqliteSnapshotStore {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            table_suffix: None,
        }
    }

    /// Redirects reads and writes to `<segment>_<suffix>` tables (sample runs).
    pub fn with_table_suffix(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        self.table_suffix = (!suffix.is_empty()).then_some(suffix);
        self
    }

    pub fn table_for(&self, segment: Segment) -> String {
        match &self.table_suffix {
            Some(suffix) => format!("{}_{}", segment.table_name(), suffix),
            None => segment.table_name().to_string(),
        }
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Applies a user report to one row. Returns `false` when the listing is unknown.
    pub async fn mark_reported(
        &self,
        segment: Segment,
        listing_id: &str,
        report: &ListingReport,
    ) -> Result<bool, StoreError> {
        let table = self.table_for(segment);
        if !self.table_exists(&table).await? {
            return Ok(false);
        }

        let result = if report.marks_inactive() {
            sqlx::query(&format!(
                r#"UPDATE "{table}" SET reported_as_inactive = 1 WHERE listing_id = ?"#
            ))
            .bind(listing_id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                r#"UPDATE "{table}" SET report_option = ?, report_text = ? WHERE listing_id = ?"#
            ))
            .bind(&report.option)
            .bind(report.text.as_deref())
            .bind(listing_id)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() > 0)
    }
}

fn corrupt(table: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table: table.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn read_snapshot(&self, segment: Segment) -> Result<Vec<Listing>, StoreError> {
        let table = self.table_for(segment);
        if !self.table_exists(&table).await? {
            debug!(%table, "no snapshot table yet");
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"SELECT listing_id, reported_as_inactive, report_option, report_text, date_processed, data_json
                 FROM "{table}"
                ORDER BY rowid"#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| corrupt(&table, format!("unreadable rows: {err}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let listing_id: String = row
                .try_get("listing_id")
                .map_err(|err| corrupt(&table, err.to_string()))?;
            let data_json: String = row
                .try_get("data_json")
                .map_err(|err| corrupt(&table, format!("{listing_id}: {err}")))?;
            let mut listing: Listing = serde_json::from_str(&data_json)
                .map_err(|err| corrupt(&table, format!("{listing_id}: undecodable data_json: {err}")))?;
            if listing.listing_id != listing_id {
                return Err(corrupt(
                    &table,
                    format!("row key {listing_id} does not match payload id {}", listing.listing_id),
                ));
            }
            if listing.context != segment {
                return Err(corrupt(
                    &table,
                    format!("{listing_id}: payload belongs to segment {}", listing.context),
                ));
            }

            // Moderation columns are updated in place by reports and win over the payload.
            let moderation =
                |column: &str, err: sqlx::Error| corrupt(&table, format!("{listing_id}: {column}: {err}"));
            let inactive: Option<i64> = row
                .try_get("reported_as_inactive")
                .map_err(|err| moderation("reported_as_inactive", err))?;
            listing.reported_as_inactive = listing.reported_as_inactive || inactive.is_some_and(|v| v != 0);
            let report_option: Option<String> = row
                .try_get("report_option")
                .map_err(|err| moderation("report_option", err))?;
            if let Some(option) = report_option {
                let text: Option<String> = row
                    .try_get("report_text")
                    .map_err(|err| moderation("report_text", err))?;
                listing.report = Some(ListingReport { option, text });
            }
            let processed: Option<String> = row
                .try_get("date_processed")
                .map_err(|err| moderation("date_processed", err))?;
            if let Some(raw) = processed {
                let ts = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|err| corrupt(&table, format!("{listing_id}: date_processed {raw:?}: {err}")))?;
                listing.date_processed = Some(ts.with_timezone(&Utc));
            }

            out.push(listing);
        }
        Ok(out)
    }

    async fn write_snapshot(&self, segment: Segment, listings: &[Listing]) -> Result<(), StoreError> {
        let table = self.table_for(segment);
        let next = format!("{table}__next");

        let mut encoded = Vec::with_capacity(listings.len());
        for listing in listings {
            let json = serde_json::to_string(listing).map_err(|source| StoreError::Serialize {
                listing_id: listing.listing_id.clone(),
                source,
            })?;
            encoded.push((listing, json));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{next}""#))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            r#"CREATE TABLE "{next}" (
                listing_id TEXT PRIMARY KEY,
                reported_as_inactive INTEGER NOT NULL DEFAULT 0,
                report_option TEXT,
                report_text TEXT,
                date_processed TEXT,
                data_json TEXT NOT NULL
            )"#
        ))
        .execute(&mut *tx)
        .await?;

        let insert = format!(
            r#"INSERT INTO "{next}"
                (listing_id, reported_as_inactive, report_option, report_text, date_processed, data_json)
                VALUES (?, ?, ?, ?, ?, ?)"#
        );
        for (listing, json) in &encoded {
            let report = listing.report.as_ref();
            sqlx::query(&insert)
                .bind(&listing.listing_id)
                .bind(i64::from(listing.reported_as_inactive))
                .bind(report.map(|r| r.option.as_str()))
                .bind(report.and_then(|r| r.text.as_deref()))
                .bind(listing.date_processed.map(|ts| ts.to_rfc3339()))
                .bind(json)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(r#"ALTER TABLE "{next}" RENAME TO "{table}""#))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(%table, rows = listings.len(), "snapshot replaced");
        Ok(())
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    tables: Mutex<HashMap<Segment, Vec<Listing>>>,
    poisoned: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, segment: Segment, listings: Vec<Listing>) -> Self {
        self.tables.get_mut().insert(segment, listings);
        self
    }

    /// Makes every subsequent read fail as if the stored table were corrupt.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub async fn snapshot(&self, segment: Segment) -> Option<Vec<Listing>> {
        self.tables.lock().await.get(&segment).cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read_snapshot(&self, segment: Segment) -> Result<Vec<Listing>, StoreError> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(corrupt(segment.table_name(), "poisoned in-memory snapshot"));
        }
        Ok(self.tables.lock().await.get(&segment).cloned().unwrap_or_default())
    }

    async fn write_snapshot(&self, segment: Segment, listings: &[Listing]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "writes disabled for {}",
                segment.table_name()
            )));
        }
        self.tables.lock().await.insert(segment, listings.to_vec());
        Ok(())
    }
}
