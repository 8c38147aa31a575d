//! The worker state machine.
//!
//! One replica cycles through `Follower → Candidate → Leader{Preparing,
//! Extracting, Finalizing} → Releasing → Follower`:
//!
//! 1. **Follower**: sleep one poll interval, then try to acquire the
//!    lease.
//! 2. **Preparing**: start the heartbeat, consult the daily trigger
//!    gate, register configured files in the progress store.
//! 3. **Extracting**: from the resume page (`min(last_page)` over
//!    outstanding files), read each page once and fan it out to every
//!    file in parallel, joining all branches before advancing.
//!    Leadership and cancellation are re-checked at every page
//!    boundary, so a lost heartbeat stops the loop within one page.
//! 4. **Finalizing**: per file, strictly `remove_footer →
//!    set_completed → publish_completed`. Footer removal publishes the
//!    file on disk; the store transition makes that visible to the next
//!    run's gate and resume computation; the event goes out last so a
//!    redelivered event can never describe a file not yet recorded as
//!    complete.
//! 5. **Releasing**: release the lease on every exit path and return to
//!    follower.
//!
//! Transient external failures are retried with the configured backoff
//! before surfacing; a surfaced error ends the process non-zero and the
//! next leader resumes from durable state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use nightjar_core::day::render_file_name;
use nightjar_core::{FileId, InstanceId, WorkerId};

use crate::config::PolicyConfig;
use crate::error::{Error, Result};
use crate::health::HealthState;
use crate::heartbeat::Heartbeat;
use crate::lease::LeaseStore;
use crate::metrics::WorkerMetrics;
use crate::progress::{FileStatus, ProgressStore};
use crate::publish::{CompletionEvent, EventPublisher};
use crate::reader::{total_pages, PageReader};
use crate::retry::RetryPolicy;
use crate::row::Row;
use crate::translate::{Translator, TranslatorRegistry};
use crate::trigger::TriggerGuard;
use crate::writer::{AppendOutcome, OutputWriter, DEFAULT_STALE_LOCK_AFTER};

/// Resolved timing and retry policy for the replica loop.
///
/// Derived from [`PolicyConfig`] in production; tests construct it
/// directly with millisecond-scale durations.
#[derive(Debug, Clone, Copy)]
pub struct RunPolicy {
    /// Follower poll interval.
    pub takeover_polling_interval: Duration,
    /// Interval between lease renewals.
    pub lease_heartbeat_interval: Duration,
    /// Lease time-to-live.
    pub lease_ttl: Duration,
    /// Backoff policy for transient external failures.
    pub retry: RetryPolicy,
}

impl From<&PolicyConfig> for RunPolicy {
    fn from(policy: &PolicyConfig) -> Self {
        Self {
            takeover_polling_interval: policy.takeover_polling_interval(),
            lease_heartbeat_interval: policy.lease_heartbeat_interval(),
            lease_ttl: policy.lease_ttl(),
            retry: RetryPolicy::from_config(policy),
        }
    }
}

/// One configured output of the worker.
#[derive(Debug, Clone)]
pub struct OutputTarget {
    /// Stable identity of this output.
    pub file_id: FileId,
    /// Registry identifier of the translator producing this output.
    pub translator_id: String,
    /// Directory on the shared volume the file is written into.
    pub directory: std::path::PathBuf,
    /// File name pattern; `{date}` expands to the run day.
    pub file_name_pattern: String,
    /// Stale-lock reclaim threshold for the file's advisory lock.
    pub stale_lock_after: Duration,
}

impl OutputTarget {
    /// Creates a target with the default stale-lock threshold.
    #[must_use]
    pub fn new(
        file_id: FileId,
        translator_id: impl Into<String>,
        directory: impl Into<std::path::PathBuf>,
        file_name_pattern: impl Into<String>,
    ) -> Self {
        Self {
            file_id,
            translator_id: translator_id.into(),
            directory: directory.into(),
            file_name_pattern: file_name_pattern.into(),
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }

    fn writer_at(&self, run_day: DateTime<Utc>) -> OutputWriter {
        OutputWriter::new(
            self.file_id.clone(),
            self.directory
                .join(render_file_name(&self.file_name_pattern, run_day)),
        )
        .with_stale_lock_after(self.stale_lock_after)
    }
}

/// The collaborators the orchestrator composes.
pub struct Collaborators {
    /// Single-writer lease store.
    pub lease: Arc<dyn LeaseStore>,
    /// Per-file progress store.
    pub progress: Arc<dyn ProgressStore>,
    /// Source view reader.
    pub reader: Arc<dyn PageReader>,
    /// Translator registry.
    pub registry: Arc<TranslatorRegistry>,
    /// Completion event publisher.
    pub publisher: Arc<dyn EventPublisher>,
    /// Daily trigger gate.
    pub trigger: Arc<dyn TriggerGuard>,
}

/// One output resolved for a specific run day.
struct RunOutput {
    file_id: FileId,
    translator: Arc<dyn Translator>,
    writer: OutputWriter,
}

/// The replica state machine composing lease, gate, extraction, and
/// finalization.
pub struct Orchestrator {
    worker_id: WorkerId,
    instance_id: InstanceId,
    policy: RunPolicy,
    event_type: String,
    outputs: Vec<OutputTarget>,
    lease: Arc<dyn LeaseStore>,
    progress: Arc<dyn ProgressStore>,
    reader: Arc<dyn PageReader>,
    registry: Arc<TranslatorRegistry>,
    publisher: Arc<dyn EventPublisher>,
    trigger: Arc<dyn TriggerGuard>,
    health: Arc<HealthState>,
    retry: RetryPolicy,
    metrics: WorkerMetrics,
}

impl Orchestrator {
    /// Creates the state machine for one replica.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        instance_id: InstanceId,
        policy: RunPolicy,
        event_type: impl Into<String>,
        outputs: Vec<OutputTarget>,
        collaborators: Collaborators,
        health: Arc<HealthState>,
    ) -> Self {
        let retry = policy.retry;
        let metrics = WorkerMetrics::new(worker_id.as_str());

        Self {
            worker_id,
            instance_id,
            policy,
            event_type: event_type.into(),
            outputs,
            lease: collaborators.lease,
            progress: collaborators.progress,
            reader: collaborators.reader,
            registry: collaborators.registry,
            publisher: collaborators.publisher,
            trigger: collaborators.trigger,
            health,
            retry,
            metrics,
        }
    }

    /// The replica identity competing for the lease.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Runs the replica loop until shutdown is requested or an
    /// unrecoverable error surfaces.
    ///
    /// The lease is released on every leader exit path; losing
    /// leadership mid-run demotes back to follower rather than ending
    /// the process.
    ///
    /// # Errors
    ///
    /// Returns the surfaced error of a failed leader run; cancellation
    /// is a clean `Ok` exit.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            worker_id = %self.worker_id,
            instance_id = %self.instance_id,
            "replica started; polling for leadership"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!(worker_id = %self.worker_id, "shutdown requested; exiting");
                    return Ok(());
                }
                () = tokio::time::sleep(self.policy.takeover_polling_interval) => {}
            }

            let acquired = self
                .lease
                .try_acquire(&self.worker_id, self.instance_id, self.policy.lease_ttl)
                .await
                .unwrap_or_else(|error| {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        error = %error,
                        "lease acquisition errored; staying follower"
                    );
                    false
                });

            if !acquired {
                tracing::trace!(worker_id = %self.worker_id, "lease held elsewhere");
                continue;
            }

            self.metrics.record_lease_acquired();
            self.metrics.set_leader(true);
            self.health.set_leader(true);
            tracing::info!(
                worker_id = %self.worker_id,
                instance_id = %self.instance_id,
                "lease acquired; assuming leadership"
            );

            let outcome = self.lead(&shutdown).await;

            self.health.set_leader(false);
            self.metrics.set_leader(false);
            if let Err(error) = self.lease.release(&self.worker_id, self.instance_id).await {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    error = %error,
                    "lease release failed; TTL expiry will reclaim it"
                );
            }

            match outcome {
                Ok(()) => {
                    tracing::info!(worker_id = %self.worker_id, "leader run finished");
                }
                Err(Error::Cancelled) => {
                    tracing::info!(worker_id = %self.worker_id, "leader cancelled by shutdown");
                    return Ok(());
                }
                Err(Error::LeaseLost { .. }) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        "leadership lost mid-run; demoting to follower"
                    );
                    self.metrics.record_run_failure("lease_lost");
                }
                Err(error) => {
                    tracing::error!(
                        worker_id = %self.worker_id,
                        instance_id = %self.instance_id,
                        error = %error,
                        "leader run failed"
                    );
                    self.metrics.record_run_failure(error_kind(&error));
                    return Err(error);
                }
            }
        }
    }

    /// One leadership term: heartbeat plus the prepare/extract/finalize
    /// pipeline.
    async fn lead(&self, shutdown: &CancellationToken) -> Result<()> {
        let leader_token = shutdown.child_token();
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&self.lease),
            self.worker_id.clone(),
            self.instance_id,
            self.policy.lease_heartbeat_interval,
            self.policy.lease_ttl,
            leader_token.clone(),
            self.metrics.clone(),
        );

        let result = self.lead_inner(&leader_token).await;
        heartbeat.stop().await;

        match result {
            // The leader token fired without a host shutdown: that was
            // the heartbeat signalling lost leadership.
            Err(Error::Cancelled) if !shutdown.is_cancelled() => Err(Error::LeaseLost {
                worker_id: self.worker_id.clone(),
            }),
            other => other,
        }
    }

    async fn lead_inner(&self, token: &CancellationToken) -> Result<()> {
        Self::ensure_active(token)?;

        let should = self
            .retry
            .run("should_process", || {
                self.trigger.should_process(&self.worker_id)
            })
            .await?;
        if !should {
            tracing::info!(worker_id = %self.worker_id, "daily gate closed; releasing");
            return Ok(());
        }

        // Resolve the run's outputs up front so an unknown translator
        // id fails before anything is written.
        let run_day = Utc::now();
        let outputs = self
            .outputs
            .iter()
            .map(|target| {
                Ok(RunOutput {
                    file_id: target.file_id.clone(),
                    translator: self.registry.resolve(&target.translator_id)?,
                    writer: target.writer_at(run_day),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for output in &outputs {
            self.retry
                .run("set_start", || {
                    self.progress.set_start(&self.worker_id, &output.file_id)
                })
                .await?;
        }

        self.extract(token, &outputs).await?;

        for output in &outputs {
            Self::ensure_active(token)?;
            self.finalize_file(output).await?;
        }

        self.trigger.mark_processed(&self.worker_id).await?;
        Ok(())
    }

    /// The paginated extraction loop with per-page fan-out.
    async fn extract(&self, token: &CancellationToken, outputs: &[RunOutput]) -> Result<()> {
        let resume = self
            .retry
            .run("resume_page", || {
                self.progress.min_outstanding_page(&self.worker_id)
            })
            .await?;
        let total_rows = self
            .retry
            .run("total_rows", || self.reader.total_rows())
            .await?;
        let page_size = self.reader.page_size();
        let pages = total_pages(total_rows, page_size);

        tracing::info!(
            worker_id = %self.worker_id,
            resume_page = resume,
            total_rows,
            pages,
            "extraction starting"
        );

        let mut page = resume;
        while page < pages {
            Self::ensure_active(token)?;
            self.confirm_leadership().await?;

            let rows = self
                .retry
                .run("read_page", || self.reader.read_page(page))
                .await?;
            if rows.is_empty() {
                tracing::info!(
                    worker_id = %self.worker_id,
                    page,
                    "source exhausted early; ending extraction"
                );
                break;
            }

            let started = Instant::now();
            let row_count = u64::try_from(rows.len()).unwrap_or(u64::MAX);
            let cumulative_rows = page * page_size + row_count;

            self.fan_out(page, cumulative_rows, &rows, outputs).await?;

            self.health.record_progress();
            self.metrics
                .record_page(row_count, started.elapsed().as_secs_f64());
            tracing::debug!(
                worker_id = %self.worker_id,
                page,
                cumulative_rows,
                "page fanned out to all files"
            );

            page += 1;
        }

        Ok(())
    }

    /// Writes one page to every file concurrently, joining all branches
    /// before surfacing the first failure.
    async fn fan_out(
        &self,
        page: u64,
        cumulative_rows: u64,
        rows: &[Row],
        outputs: &[RunOutput],
    ) -> Result<()> {
        let branches = outputs
            .iter()
            .map(|output| self.fan_out_file(output, page, cumulative_rows, rows));

        let results = futures::future::join_all(branches).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn fan_out_file(
        &self,
        output: &RunOutput,
        page: u64,
        cumulative_rows: u64,
        rows: &[Row],
    ) -> Result<()> {
        let record = self
            .retry
            .run("get_progress", || self.progress.get(&output.file_id))
            .await?;
        if let Some(record) = &record {
            if record.status == FileStatus::Completed && record.last_page >= page {
                tracing::debug!(
                    worker_id = %self.worker_id,
                    file_id = %output.file_id,
                    page,
                    "file already completed; skipping"
                );
                return Ok(());
            }
        }

        let lines = output.translator.translate_page(&output.file_id, rows)?;
        let outcome = output.writer.append_page(page, cumulative_rows, &lines).await?;
        if outcome == AppendOutcome::SkippedStale {
            tracing::debug!(
                worker_id = %self.worker_id,
                file_id = %output.file_id,
                page,
                "marker already covers page; append skipped"
            );
        }

        // Recorded regardless of the append outcome: a skipped page is
        // durable by definition of the marker check, and the store's
        // monotone guards make re-recording harmless.
        self.retry
            .run("upsert_progress", || {
                self.progress
                    .upsert_progress(&self.worker_id, &output.file_id, page, cumulative_rows)
            })
            .await?;

        Ok(())
    }

    /// Finalizes one file: footer removal, status transition, event.
    /// The order is mandatory; see the module docs.
    async fn finalize_file(&self, output: &RunOutput) -> Result<()> {
        output.writer.remove_footer().await?;

        self.retry
            .run("set_completed", || {
                self.progress.set_completed(&output.file_id)
            })
            .await?;
        self.metrics.record_file_completed(output.file_id.as_str());

        let record = self
            .retry
            .run("completed_record", || self.progress.get(&output.file_id))
            .await?;
        let total_rows = record.map_or(0, |r| r.cumulative_rows);

        // One event per attempt sequence: the correlation id is stamped
        // once so bus-level retries stay deduplicable downstream.
        let event = CompletionEvent::new(
            self.worker_id.clone(),
            output.file_id.clone(),
            self.event_type.clone(),
            total_rows,
            Utc::now(),
        );
        self.retry
            .run("publish_completed", || {
                self.publisher.publish_completed(&event)
            })
            .await?;
        self.metrics.record_event_published(output.file_id.as_str());

        tracing::info!(
            worker_id = %self.worker_id,
            file_id = %output.file_id,
            total_rows,
            path = %output.writer.path().display(),
            "file finalized and published"
        );
        Ok(())
    }

    /// Aborts with a cancellation error once the leader token fires.
    fn ensure_active(token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Confirms this instance still holds the lease before a page.
    async fn confirm_leadership(&self) -> Result<()> {
        let record = self
            .retry
            .run("confirm_leadership", || self.lease.get(&self.worker_id))
            .await?;

        let held = record.is_some_and(|r| r.instance_id == self.instance_id);
        if held {
            Ok(())
        } else {
            Err(Error::LeaseLost {
                worker_id: self.worker_id.clone(),
            })
        }
    }
}

/// Stable label for run-failure metrics.
const fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::Cancelled => "cancelled",
        Error::LeaseLost { .. } => "lease_lost",
        Error::Store { .. } => "store",
        Error::PageRead { .. } => "page_read",
        Error::Write { .. } => "write",
        Error::Publish { .. } => "publish",
        Error::TranslatorNotRegistered { .. } => "translator_unregistered",
        Error::Translation { .. } => "translation",
        Error::Configuration { .. } => "configuration",
        Error::Core(_) => "core",
    }
}
