//! Postgres-backed lease store.
//!
//! One row per worker in a configured lease table. Acquisition is a
//! single conditional upsert, so no "last writer wins, then read back"
//! fallback is needed: the statement either replaces an expired (or
//! absent) record or touches nothing.
//!
//! Transient database failures in `try_acquire` and `renew` are
//! reported as "not acquired" / "not renewed" with a warning log; the
//! replica simply fails to lead this round and polls again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row as _;

use nightjar_core::{InstanceId, WorkerId};

use super::{LeaseRecord, LeaseStore};
use crate::error::{Error, Result};
use crate::pg::{store_err, validate_identifier};

/// Lease store over a Postgres table.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
    table: String,
}

impl PostgresLeaseStore {
    /// Creates a lease store over the given pool and table name.
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

    /// Creates the lease table and its expiry index if missing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the DDL statements fail.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = &self.table;
        let index = format!("{}_expires_at_idx", table.replace('.', "_"));

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                worker_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("create lease table", e))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (expires_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("create lease expiry index", e))?;

        Ok(())
    }

    /// Deletes expired lease records.
    ///
    /// A safety net, not a correctness requirement: `try_acquire`
    /// already treats expired records as absent.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at <= $1",
            self.table
        ))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("purge expired leases", e))?;

        Ok(result.rows_affected())
    }

    fn expiry(ttl: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120))
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn try_acquire(
        &self,
        worker_id: &WorkerId,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let table = &self.table;

        let result = sqlx::query(&format!(
            "INSERT INTO {table} (worker_id, instance_id, acquired_at, expires_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (worker_id) DO UPDATE SET
                instance_id = EXCLUDED.instance_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
             WHERE {table}.expires_at <= $3 OR {table}.instance_id = $2"
        ))
        .bind(worker_id.as_str())
        .bind(instance_id.to_string())
        .bind(now)
        .bind(Self::expiry(ttl, now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(outcome) => Ok(outcome.rows_affected() == 1),
            Err(error) => {
                tracing::warn!(
                    worker_id = %worker_id,
                    error = %error,
                    "lease acquisition failed; treating as not acquired"
                );
                Ok(false)
            }
        }
    }

    async fn renew(
        &self,
        worker_id: &WorkerId,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();

        let result = sqlx::query(&format!(
            "UPDATE {} SET expires_at = $3 WHERE worker_id = $1 AND instance_id = $2",
            self.table
        ))
        .bind(worker_id.as_str())
        .bind(instance_id.to_string())
        .bind(Self::expiry(ttl, now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(outcome) => Ok(outcome.rows_affected() == 1),
            Err(error) => {
                tracing::warn!(
                    worker_id = %worker_id,
                    error = %error,
                    "lease renewal failed; treating as not renewed"
                );
                Ok(false)
            }
        }
    }

    async fn release(&self, worker_id: &WorkerId, instance_id: InstanceId) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE worker_id = $1 AND instance_id = $2",
            self.table
        ))
        .bind(worker_id.as_str())
        .bind(instance_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("release lease", e))?;

        Ok(())
    }

    async fn is_expired_or_unheld(&self, worker_id: &WorkerId) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT expires_at FROM {} WHERE worker_id = $1",
            self.table
        ))
        .bind(worker_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("read lease expiry", e))?;

        Ok(match row {
            None => true,
            Some(row) => {
                let expires_at: DateTime<Utc> = row
                    .try_get("expires_at")
                    .map_err(|e| store_err("decode lease expiry", e))?;
                expires_at <= Utc::now()
            }
        })
    }

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(&format!(
            "SELECT worker_id, instance_id, acquired_at, expires_at
             FROM {} WHERE worker_id = $1",
            self.table
        ))
        .bind(worker_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("read lease record", e))?;

        row.map(|row| {
            let worker: String = row
                .try_get("worker_id")
                .map_err(|e| store_err("decode lease worker", e))?;
            let instance: String = row
                .try_get("instance_id")
                .map_err(|e| store_err("decode lease instance", e))?;

            Ok(LeaseRecord {
                worker_id: WorkerId::new(worker).map_err(Error::Core)?,
                instance_id: instance.parse().map_err(Error::Core)?,
                acquired_at: row
                    .try_get("acquired_at")
                    .map_err(|e| store_err("decode lease acquired_at", e))?,
                expires_at: row
                    .try_get("expires_at")
                    .map_err(|e| store_err("decode lease expires_at", e))?,
            })
        })
        .transpose()
    }
}
