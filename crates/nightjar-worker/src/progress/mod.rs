//! Per-file export progress tracking.
//!
//! The progress store is the fleet-visible record of how far each
//! output file has advanced: its status, the last durably written page,
//! and the cumulative row count. Together with the in-file marker it
//! drives the crash-resume protocol: the store is the truth for "what
//! the fleet has observed", the marker for "what is on disk".
//!
//! All operations are upsert-shaped and idempotent so retried calls and
//! takeover re-execution are harmless.

pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nightjar_core::{FileId, WorkerId};

use crate::error::{Error, Result};

/// Lifecycle status of one output file within a run.
///
/// Transitions are monotone: `Started → InProgress → Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// The file has been registered for the run but no page was written.
    Started,
    /// At least one page has been written and recorded.
    InProgress,
    /// The file has been finalized and published.
    Completed,
}

impl FileStatus {
    /// Returns the wire/storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Self::Started),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(Error::store(format!("unknown file status: '{other}'"))),
        }
    }
}

/// Progress record for one output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    /// The output file this record tracks.
    pub file_id: FileId,
    /// The workload the file belongs to.
    pub worker_id: WorkerId,
    /// Current lifecycle status.
    pub status: FileStatus,
    /// The last page durably written and recorded. Never decreases.
    pub last_page: u64,
    /// Total rows written through `last_page`. Never decreases.
    pub cumulative_rows: u64,
    /// When the record was (re-)initialized for a run.
    pub started_at: DateTime<Utc>,
    /// When the file was finalized; set iff status is `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileProgress {
    /// Returns true when the file still needs work this run.
    #[must_use]
    pub const fn is_outstanding(&self) -> bool {
        !matches!(self.status, FileStatus::Completed)
    }
}

/// Store of per-file status records and page/row counters.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Registers a file for a run.
    ///
    /// Creates the record with `Started` status on first observation.
    /// An existing record is left untouched, with one exception: a
    /// record completed on a *previous* UTC day is reset to a fresh
    /// `Started` record so the new day's run starts from page zero.
    async fn set_start(&self, worker_id: &WorkerId, file_id: &FileId) -> Result<()>;

    /// Records a durably written page.
    ///
    /// Sets `InProgress`, `last_page`, and `cumulative_rows`. Counters
    /// never regress: a stale page is ignored, and a `Completed` record
    /// is never reopened.
    async fn upsert_progress(
        &self,
        worker_id: &WorkerId,
        file_id: &FileId,
        page: u64,
        cumulative_rows: u64,
    ) -> Result<()>;

    /// Marks a file finalized. Idempotent; the first completion
    /// timestamp is preserved.
    async fn set_completed(&self, file_id: &FileId) -> Result<()>;

    /// Reads one file's record, if any.
    async fn get(&self, file_id: &FileId) -> Result<Option<FileProgress>>;

    /// Lists all records belonging to a worker.
    async fn list_by_worker(&self, worker_id: &WorkerId) -> Result<Vec<FileProgress>>;

    /// Returns the resume page: `min(last_page)` over the worker's
    /// non-completed records, or 0 when none are outstanding.
    async fn min_outstanding_page(&self, worker_id: &WorkerId) -> Result<u64>;
}
