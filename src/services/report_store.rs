//! SQLite persistence for raster reports, one row per `(bucket, key)`.

use crate::models::report::{RasterReport, ReportRow, StoredReport};
use chrono::Utc;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("stored report for `{key}` is corrupt: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ReportResult<T> = Result<T, ReportError>;

/// Metadata recorded alongside a report.
#[derive(Debug, Clone)]
pub struct ReportRecord<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub etag: Option<&'a str>,
    pub size_bytes: i64,
    pub event_name: &'a str,
}

#[derive(Clone)]
pub struct ReportStore {
    pub db: Arc<SqlitePool>,
}

impl ReportStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str) -> ReportResult<Self> {
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:")
                .trim_start_matches("file:");
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    info!("Created missing directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        debug!(database_url, "connected to report database");
        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> ReportResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> ReportResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    /// Insert or overwrite the report for `(bucket, key)`.
    pub async fn upsert(
        &self,
        record: ReportRecord<'_>,
        report: &RasterReport,
    ) -> ReportResult<StoredReport> {
        let body = serde_json::to_string(report).map_err(|source| ReportError::Corrupt {
            key: record.key.to_string(),
            source,
        })?;

        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            INSERT INTO raster_reports (
                id, bucket, key, etag, size_bytes, event_name, processed_at, report
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                event_name = excluded.event_name,
                processed_at = excluded.processed_at,
                report = excluded.report
            RETURNING id, bucket, key, etag, size_bytes, event_name, processed_at, report
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.bucket)
        .bind(record.key)
        .bind(record.etag)
        .bind(record.size_bytes)
        .bind(record.event_name)
        .bind(Utc::now())
        .bind(body)
        .fetch_one(&*self.db)
        .await?;

        into_stored(row)
    }

    pub async fn get(&self, bucket: &str, key: &str) -> ReportResult<Option<StoredReport>> {
        let row = sqlx::query_as::<_, ReportRow>(
            "SELECT id, bucket, key, etag, size_bytes, event_name, processed_at, report
             FROM raster_reports WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        row.map(into_stored).transpose()
    }

    /// Key-ordered listing, optionally restricted to a key prefix.
    ///
    /// `limit` is clamped to 1..=1000.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> ReportResult<Vec<StoredReport>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT) as i64;
        let prefix = prefix.unwrap_or("");
        let rows = sqlx::query_as::<_, ReportRow>(
            "SELECT id, bucket, key, etag, size_bytes, event_name, processed_at, report
             FROM raster_reports
             WHERE bucket = ? AND substr(key, 1, length(?)) = ?
             ORDER BY key ASC LIMIT ?",
        )
        .bind(bucket)
        .bind(prefix)
        .bind(prefix)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(into_stored).collect()
    }

    /// Returns whether a report existed.
    pub async fn delete(&self, bucket: &str, key: &str) -> ReportResult<bool> {
        let result = sqlx::query("DELETE FROM raster_reports WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn into_stored(row: ReportRow) -> ReportResult<StoredReport> {
    let key = row.key.clone();
    StoredReport::try_from(row).map_err(|source| ReportError::Corrupt { key, source })
}

#[cfg(test)]
pub(crate) async fn memory_store() -> ReportStore {
    let store = ReportStore::connect("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();
    store
}
