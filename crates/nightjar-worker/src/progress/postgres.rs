//! Postgres-backed progress store.
//!
//! One row per file in a configured status table. Every statement is
//! conditional so retried calls, duplicate fan-out attempts, and
//! takeover re-execution leave the record consistent:
//!
//! - `set_start` inserts, or resets only a prior-day completion
//! - `upsert_progress` never lowers counters or reopens a completion
//! - `set_completed` preserves the first completion timestamp

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row as _;

use nightjar_core::{FileId, WorkerId};

use super::{FileProgress, FileStatus, ProgressStore};
use crate::error::{Error, Result};
use crate::pg::{store_err, validate_identifier};

/// Progress store over a Postgres table.
#[derive(Debug, Clone)]
pub struct PostgresProgressStore {
    pool: PgPool,
    table: String,
}

impl PostgresProgressStore {
    /// Creates a progress store over the given pool and table name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the table name is not a valid
    /// identifier.
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Creates the status table and its worker index if missing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the DDL statements fail.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = &self.table;
        let index = format!("{}_worker_id_idx", table.replace('.', "_"));

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                file_id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                status TEXT NOT NULL,
                last_page BIGINT NOT NULL DEFAULT 0,
                cumulative_rows BIGINT NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("create status table", e))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (worker_id)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("create status worker index", e))?;

        Ok(())
    }

    fn decode(row: &PgRow) -> Result<FileProgress> {
        let file_id: String = row
            .try_get("file_id")
            .map_err(|e| store_err("decode file_id", e))?;
        let worker_id: String = row
            .try_get("worker_id")
            .map_err(|e| store_err("decode worker_id", e))?;
        let status: String = row
            .try_get("status")
            .map_err(|e| store_err("decode status", e))?;
        let last_page: i64 = row
            .try_get("last_page")
            .map_err(|e| store_err("decode last_page", e))?;
        let cumulative_rows: i64 = row
            .try_get("cumulative_rows")
            .map_err(|e| store_err("decode cumulative_rows", e))?;
        let started_at: DateTime<Utc> = row
            .try_get("started_at")
            .map_err(|e| store_err("decode started_at", e))?;
        let completed_at: Option<DateTime<Utc>> = row
            .try_get("completed_at")
            .map_err(|e| store_err("decode completed_at", e))?;

        Ok(FileProgress {
            file_id: FileId::new(file_id).map_err(Error::Core)?,
            worker_id: WorkerId::new(worker_id).map_err(Error::Core)?,
            status: status.parse()?,
            last_page: u64::try_from(last_page).unwrap_or(0),
            cumulative_rows: u64::try_from(cumulative_rows).unwrap_or(0),
            started_at,
            completed_at,
        })
    }

    fn db_i64(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn set_start(&self, worker_id: &WorkerId, file_id: &FileId) -> Result<()> {
        let table = &self.table;
        let now = Utc::now();
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or(now, |naive| naive.and_utc());

        sqlx::query(&format!(
            "INSERT INTO {table}
                (file_id, worker_id, status, last_page, cumulative_rows, started_at, completed_at)
             VALUES ($1, $2, $3, 0, 0, $4, NULL)
             ON CONFLICT (file_id) DO UPDATE SET
                worker_id = EXCLUDED.worker_id,
                status = EXCLUDED.status,
                last_page = 0,
                cumulative_rows = 0,
                started_at = EXCLUDED.started_at,
                completed_at = NULL
             WHERE {table}.status = $5 AND {table}.completed_at < $6"
        ))
        .bind(file_id.as_str())
        .bind(worker_id.as_str())
        .bind(FileStatus::Started.as_str())
        .bind(now)
        .bind(FileStatus::Completed.as_str())
        .bind(day_start)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("set start", e))?;

        Ok(())
    }

    async fn upsert_progress(
        &self,
        worker_id: &WorkerId,
        file_id: &FileId,
        page: u64,
        cumulative_rows: u64,
    ) -> Result<()> {
        let table = &self.table;

        sqlx::query(&format!(
            "INSERT INTO {table}
                (file_id, worker_id, status, last_page, cumulative_rows, started_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (file_id) DO UPDATE SET
                status = EXCLUDED.status,
                last_page = GREATEST({table}.last_page, EXCLUDED.last_page),
                cumulative_rows = GREATEST({table}.cumulative_rows, EXCLUDED.cumulative_rows)
             WHERE {table}.status <> $7"
        ))
        .bind(file_id.as_str())
        .bind(worker_id.as_str())
        .bind(FileStatus::InProgress.as_str())
        .bind(Self::db_i64(page))
        .bind(Self::db_i64(cumulative_rows))
        .bind(Utc::now())
        .bind(FileStatus::Completed.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("upsert progress", e))?;

        Ok(())
    }

    async fn set_completed(&self, file_id: &FileId) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = $2, completed_at = $3
             WHERE file_id = $1 AND status <> $2",
            self.table
        ))
        .bind(file_id.as_str())
        .bind(FileStatus::Completed.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("set completed", e))?;

        Ok(())
    }

    async fn get(&self, file_id: &FileId) -> Result<Option<FileProgress>> {
        let row = sqlx::query(&format!(
            "SELECT file_id, worker_id, status, last_page, cumulative_rows,
                    started_at, completed_at
             FROM {} WHERE file_id = $1",
            self.table
        ))
        .bind(file_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("read progress record", e))?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_by_worker(&self, worker_id: &WorkerId) -> Result<Vec<FileProgress>> {
        let rows = sqlx::query(&format!(
            "SELECT file_id, worker_id, status, last_page, cumulative_rows,
                    started_at, completed_at
             FROM {} WHERE worker_id = $1 ORDER BY file_id",
            self.table
        ))
        .bind(worker_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("list progress records", e))?;

        rows.iter().map(Self::decode).collect()
    }

    async fn min_outstanding_page(&self, worker_id: &WorkerId) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT MIN(last_page) AS resume_page
             FROM {} WHERE worker_id = $1 AND status <> $2",
            self.table
        ))
        .bind(worker_id.as_str())
        .bind(FileStatus::Completed.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err("compute resume page", e))?;

        let resume: Option<i64> = row
            .try_get("resume_page")
            .map_err(|e| store_err("decode resume page", e))?;

        Ok(resume.and_then(|page| u64::try_from(page).ok()).unwrap_or(0))
    }
}
