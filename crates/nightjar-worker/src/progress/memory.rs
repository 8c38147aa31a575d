//! In-memory progress store implementation for testing.
//!
//! Shares the production store's conditional-update semantics,
//! including the new-day reset in `set_start` and the monotone-counter
//! guards in `upsert_progress`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use nightjar_core::day::same_utc_day;
use nightjar_core::{FileId, WorkerId};

use super::{FileProgress, FileStatus, ProgressStore};
use crate::error::{Error, Result};

/// In-memory progress store for testing.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    records: RwLock<HashMap<FileId, FileProgress>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

impl InMemoryProgressStore {
    /// Creates a new empty progress store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: rewrites a record's completion instant so day
    /// boundary behavior can be exercised without waiting for midnight.
    #[doc(hidden)]
    pub fn override_completed_at(&self, file_id: &FileId, at: chrono::DateTime<Utc>) {
        if let Ok(mut records) = self.records.write() {
            if let Some(record) = records.get_mut(file_id) {
                record.completed_at = Some(at);
            }
        }
    }

    fn fresh(worker_id: &WorkerId, file_id: &FileId) -> FileProgress {
        FileProgress {
            file_id: file_id.clone(),
            worker_id: worker_id.clone(),
            status: FileStatus::Started,
            last_page: 0,
            cumulative_rows: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn set_start(&self, worker_id: &WorkerId, file_id: &FileId) -> Result<()> {
        let mut records = self.records.write().map_err(poison_err)?;
        let now = Utc::now();

        match records.get(file_id) {
            None => {
                records.insert(file_id.clone(), Self::fresh(worker_id, file_id));
            }
            Some(existing) => {
                let completed_on_prior_day = existing.status == FileStatus::Completed
                    && existing
                        .completed_at
                        .is_some_and(|at| !same_utc_day(at, now));
                if completed_on_prior_day {
                    records.insert(file_id.clone(), Self::fresh(worker_id, file_id));
                }
            }
        }

        Ok(())
    }

    async fn upsert_progress(
        &self,
        worker_id: &WorkerId,
        file_id: &FileId,
        page: u64,
        cumulative_rows: u64,
    ) -> Result<()> {
        let mut records = self.records.write().map_err(poison_err)?;

        let record = records
            .entry(file_id.clone())
            .or_insert_with(|| Self::fresh(worker_id, file_id));

        if record.status == FileStatus::Completed {
            return Ok(());
        }

        record.status = FileStatus::InProgress;
        record.last_page = record.last_page.max(page);
        record.cumulative_rows = record.cumulative_rows.max(cumulative_rows);

        Ok(())
    }

    async fn set_completed(&self, file_id: &FileId) -> Result<()> {
        let mut records = self.records.write().map_err(poison_err)?;

        if let Some(record) = records.get_mut(file_id) {
            if record.status != FileStatus::Completed {
                record.status = FileStatus::Completed;
                record.completed_at = Some(Utc::now());
            }
        }

        Ok(())
    }

    async fn get(&self, file_id: &FileId) -> Result<Option<FileProgress>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.get(file_id).cloned())
    }

    async fn list_by_worker(&self, worker_id: &WorkerId) -> Result<Vec<FileProgress>> {
        let records = self.records.read().map_err(poison_err)?;

        let mut matching: Vec<FileProgress> = records
            .values()
            .filter(|record| &record.worker_id == worker_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        Ok(matching)
    }

    async fn min_outstanding_page(&self, worker_id: &WorkerId) -> Result<u64> {
        let records = self.records.read().map_err(poison_err)?;

        Ok(records
            .values()
            .filter(|record| &record.worker_id == worker_id && record.is_outstanding())
            .map(|record| record.last_page)
            .min()
            .unwrap_or(0))
    }
}
