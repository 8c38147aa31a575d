//! Observability metrics for the export worker.
//!
//! Exposed via the `metrics` crate facade; the host installs a
//! Prometheus recorder. Metrics are designed to answer the operational
//! questions a replicated batch worker raises:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `nightjar_lease_acquisitions_total` | Counter | `worker` | Successful lease acquisitions |
//! | `nightjar_lease_renewal_failures_total` | Counter | `worker` | Renewals that lost leadership |
//! | `nightjar_is_leader` | Gauge | `worker` | 1 while this replica leads |
//! | `nightjar_pages_written_total` | Counter | `worker` | Pages fanned out to all files |
//! | `nightjar_rows_written_total` | Counter | `worker` | Rows extracted and written |
//! | `nightjar_page_duration_seconds` | Histogram | `worker` | Per-page fan-out latency |
//! | `nightjar_files_completed_total` | Counter | `worker`, `file` | Files finalized |
//! | `nightjar_events_published_total` | Counter | `worker`, `file` | Completion events published |
//! | `nightjar_run_failures_total` | Counter | `worker`, `kind` | Leader runs ended in error |

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: successful lease acquisitions.
    pub const LEASE_ACQUISITIONS_TOTAL: &str = "nightjar_lease_acquisitions_total";
    /// Counter: renewals that lost leadership.
    pub const LEASE_RENEWAL_FAILURES_TOTAL: &str = "nightjar_lease_renewal_failures_total";
    /// Gauge: 1 while this replica leads, 0 otherwise.
    pub const IS_LEADER: &str = "nightjar_is_leader";
    /// Counter: pages fanned out to all files.
    pub const PAGES_WRITTEN_TOTAL: &str = "nightjar_pages_written_total";
    /// Counter: rows extracted and written.
    pub const ROWS_WRITTEN_TOTAL: &str = "nightjar_rows_written_total";
    /// Histogram: per-page fan-out latency in seconds.
    pub const PAGE_DURATION_SECONDS: &str = "nightjar_page_duration_seconds";
    /// Counter: files finalized.
    pub const FILES_COMPLETED_TOTAL: &str = "nightjar_files_completed_total";
    /// Counter: completion events published.
    pub const EVENTS_PUBLISHED_TOTAL: &str = "nightjar_events_published_total";
    /// Counter: leader runs that ended in error.
    pub const RUN_FAILURES_TOTAL: &str = "nightjar_run_failures_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Worker identity.
    pub const WORKER: &str = "worker";
    /// Output file identity.
    pub const FILE: &str = "file";
    /// Failure kind.
    pub const KIND: &str = "kind";
}

/// Metric recorder bound to one worker identity.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    worker: String,
}

impl WorkerMetrics {
    /// Creates a recorder for the given worker.
    #[must_use]
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }

    /// Records a successful lease acquisition.
    pub fn record_lease_acquired(&self) {
        counter!(
            names::LEASE_ACQUISITIONS_TOTAL,
            labels::WORKER => self.worker.clone(),
        )
        .increment(1);
    }

    /// Records a renewal that failed and cost leadership.
    pub fn record_renewal_failure(&self) {
        counter!(
            names::LEASE_RENEWAL_FAILURES_TOTAL,
            labels::WORKER => self.worker.clone(),
        )
        .increment(1);
    }

    /// Flags whether this replica currently leads.
    pub fn set_leader(&self, is_leader: bool) {
        gauge!(
            names::IS_LEADER,
            labels::WORKER => self.worker.clone(),
        )
        .set(if is_leader { 1.0 } else { 0.0 });
    }

    /// Records one fanned-out page and its row count.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_page(&self, rows: u64, duration_secs: f64) {
        counter!(
            names::PAGES_WRITTEN_TOTAL,
            labels::WORKER => self.worker.clone(),
        )
        .increment(1);
        counter!(
            names::ROWS_WRITTEN_TOTAL,
            labels::WORKER => self.worker.clone(),
        )
        .increment(rows);
        histogram!(
            names::PAGE_DURATION_SECONDS,
            labels::WORKER => self.worker.clone(),
        )
        .record(duration_secs);
    }

    /// Records a finalized file.
    pub fn record_file_completed(&self, file: &str) {
        counter!(
            names::FILES_COMPLETED_TOTAL,
            labels::WORKER => self.worker.clone(),
            labels::FILE => file.to_string(),
        )
        .increment(1);
    }

    /// Records a published completion event.
    pub fn record_event_published(&self, file: &str) {
        counter!(
            names::EVENTS_PUBLISHED_TOTAL,
            labels::WORKER => self.worker.clone(),
            labels::FILE => file.to_string(),
        )
        .increment(1);
    }

    /// Records a leader run that ended in error.
    pub fn record_run_failure(&self, kind: &str) {
        counter!(
            names::RUN_FAILURES_TOTAL,
            labels::WORKER => self.worker.clone(),
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }
}
