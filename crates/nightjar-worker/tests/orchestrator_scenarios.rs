//! End-to-end scenarios over the in-memory collaborators.
//!
//! Each test drives the full orchestrator state machine (lease, daily
//! gate, extraction fan-out, finalization, events) against tempdir
//! output files.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use nightjar_core::{FileId, InstanceId, WorkerId};
use nightjar_worker::error::Result;
use nightjar_worker::health::HealthState;
use nightjar_worker::lease::memory::InMemoryLeaseStore;
use nightjar_worker::lease::{LeaseRecord, LeaseStore};
use nightjar_worker::orchestrator::{Collaborators, Orchestrator, OutputTarget, RunPolicy};
use nightjar_worker::progress::memory::InMemoryProgressStore;
use nightjar_worker::progress::{FileStatus, ProgressStore};
use nightjar_worker::publish::memory::InMemoryEventPublisher;
use nightjar_worker::publish::EventPublisher;
use nightjar_worker::reader::memory::InMemoryPageReader;
use nightjar_worker::reader::PageReader;
use nightjar_worker::retry::RetryPolicy;
use nightjar_worker::row::{Row, RowColumn};
use nightjar_worker::translate::TranslatorRegistry;
use nightjar_worker::trigger::ProgressTriggerGuard;
use nightjar_worker::writer::{AppendOutcome, OutputWriter};

const EVENT_TYPE: &str = "export.completed";

fn worker() -> WorkerId {
    WorkerId::new("LoanWorker").expect("valid")
}

fn file(name: &str) -> FileId {
    FileId::new(name).expect("valid")
}

fn loan_rows(count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| {
            Row::new(vec![
                RowColumn::new("loan_id", json!(i)),
                RowColumn::new("borrower", json!(format!("r{i}"))),
            ])
        })
        .collect()
}

/// Rendered line of row `i` under the default delimited translator.
fn delimited_line(i: usize) -> String {
    format!("{i},r{i}")
}

fn test_policy() -> RunPolicy {
    RunPolicy {
        takeover_polling_interval: Duration::from_millis(5),
        lease_heartbeat_interval: Duration::from_millis(10),
        lease_ttl: Duration::from_millis(500),
        retry: RetryPolicy::new(2, Duration::from_millis(1), 2.0),
    }
}

struct Rig {
    dir: tempfile::TempDir,
    lease: Arc<InMemoryLeaseStore>,
    progress: Arc<InMemoryProgressStore>,
    reader: Arc<InMemoryPageReader>,
    publisher: Arc<InMemoryEventPublisher>,
    files: Vec<(&'static str, &'static str)>,
}

impl Rig {
    fn new(rows: usize, page_size: u64, files: &[(&'static str, &'static str)]) -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            lease: Arc::new(InMemoryLeaseStore::new()),
            progress: Arc::new(InMemoryProgressStore::new()),
            reader: Arc::new(InMemoryPageReader::new(loan_rows(rows), page_size)),
            publisher: Arc::new(InMemoryEventPublisher::new()),
            files: files.to_vec(),
        }
    }

    fn output_path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(format!("{name}.out"))
    }

    fn output_writer(&self, name: &str) -> OutputWriter {
        OutputWriter::new(file(name), self.output_path(name))
    }

    fn orchestrator_with_reader(&self, reader: Arc<dyn PageReader>) -> Orchestrator {
        let outputs = self
            .files
            .iter()
            .map(|(name, translator)| {
                OutputTarget::new(file(name), *translator, self.dir.path(), format!("{name}.out"))
            })
            .collect();

        let trigger = Arc::new(ProgressTriggerGuard::new(
            self.progress.clone() as Arc<dyn ProgressStore>,
            self.files.iter().map(|(name, _)| file(name)).collect(),
            Duration::from_secs(86_400),
        ));

        Orchestrator::new(
            worker(),
            InstanceId::generate(),
            test_policy(),
            EVENT_TYPE,
            outputs,
            Collaborators {
                lease: self.lease.clone(),
                progress: self.progress.clone(),
                reader,
                registry: Arc::new(TranslatorRegistry::with_defaults()),
                publisher: self.publisher.clone(),
                trigger,
            },
            Arc::new(HealthState::new()),
        )
    }

    fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with_reader(self.reader.clone())
    }

    async fn events(&self) -> usize {
        self.publisher.events().expect("events").len()
    }
}

/// Runs a replica until the expected number of completion events have
/// been published, then shuts it down.
async fn run_to_completion(
    orchestrator: Orchestrator,
    publisher: Arc<InMemoryEventPublisher>,
    expected_events: usize,
) -> Result<()> {
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if publisher.events().expect("events").len() >= expected_events {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for completion events"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown.cancel();
    handle.await.expect("join")
}

/// S2 and S5: one read per page fans out to every file, and
/// finalization leaves marker-free files, completed records, and one
/// event per file.
#[tokio::test]
async fn shared_page_fan_out_and_finalization() -> Result<()> {
    let rig = Rig::new(5, 3, &[("a", "delimited"), ("b", "delimited"), ("c", "json-line")]);

    run_to_completion(rig.orchestrator(), rig.publisher.clone(), 3).await?;

    // One read per page, shared by all three files.
    assert_eq!(rig.reader.pages_read(), vec![0, 1]);

    // Delimited outputs: five rows, no marker.
    for name in ["a", "b"] {
        let contents = tokio::fs::read_to_string(rig.output_path(name))
            .await
            .expect("readable");
        let expected: String = (0..5).map(|i| delimited_line(i) + "\n").collect();
        assert_eq!(contents, expected, "file {name}");
    }

    // JSON output: five standalone objects.
    let contents = tokio::fs::read_to_string(rig.output_path("c"))
        .await
        .expect("readable");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(lines[4]).expect("json")["loan_id"],
        json!(4)
    );

    // Progress records completed; events carry the data line count.
    for (name, _) in &rig.files {
        let record = rig.progress.get(&file(name)).await?.expect("record");
        assert_eq!(record.status, FileStatus::Completed);
        assert_eq!(record.cumulative_rows, 5);
        assert!(record.completed_at.is_some());
    }

    let events = rig.publisher.events()?;
    assert_eq!(events.len(), 3);
    for event in &events {
        assert_eq!(event.event_type, EVENT_TYPE);
        assert_eq!(event.total_rows, 5);
        assert!(event
            .correlation_id
            .starts_with(&format!("LoanWorker:{}:", event.file_id)));
    }

    Ok(())
}

/// S1: the first replica runs; a concurrent replica cannot acquire the
/// lease; a later replica the same day sees the gate closed and
/// releases immediately.
#[tokio::test]
async fn daily_trigger_and_mutual_exclusion() -> Result<()> {
    /// Reader that blocks until the test opens the gate, holding the
    /// leader mid-run.
    struct GatedReader {
        inner: Arc<InMemoryPageReader>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl PageReader for GatedReader {
        async fn read_page(&self, page: u64) -> Result<Vec<Row>> {
            let _permit = self.gate.acquire().await.expect("gate open");
            self.inner.read_page(page).await
        }

        async fn total_rows(&self) -> Result<u64> {
            self.inner.total_rows().await
        }

        fn page_size(&self) -> u64 {
            self.inner.page_size()
        }
    }

    let rig = Rig::new(4, 2, &[("a", "delimited")]);
    let gated = Arc::new(GatedReader {
        inner: rig.reader.clone(),
        gate: tokio::sync::Semaphore::new(0),
    });

    let shutdown = CancellationToken::new();
    let leader = rig.orchestrator_with_reader(gated.clone());
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { leader.run(shutdown).await })
    };

    // Wait for the leader to hold the lease (blocked at page 0).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while rig.lease.get(&worker()).await?.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // A concurrent replica cannot acquire.
    assert!(
        !rig.lease
            .try_acquire(&worker(), InstanceId::generate(), Duration::from_secs(60))
            .await?
    );

    // Open the gate; the run completes and publishes.
    gated.gate.add_permits(100);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while rig.events().await < 1 {
        assert!(tokio::time::Instant::now() < deadline, "no completion event");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    handle.await.expect("join")?;

    // A third replica later the same day: gate closed, releases
    // immediately, reads nothing further.
    let reads_before = rig.reader.reads();
    let shutdown = CancellationToken::new();
    let late = rig.orchestrator();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { late.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    handle.await.expect("join")?;

    assert_eq!(rig.reader.reads(), reads_before);
    assert_eq!(rig.events().await, 1);
    assert!(rig.lease.get(&worker()).await?.is_none(), "lease released");

    Ok(())
}

/// S3: a takeover leader resumes at `min(last_page)` across files;
/// files already past the resume page no-op on re-application.
#[tokio::test]
async fn takeover_resumes_at_min_outstanding_page() -> Result<()> {
    let rig = Rig::new(60, 10, &[("a", "delimited"), ("b", "delimited"), ("c", "delimited")]);

    // Crashed leader L1: pages 0..=4 for a and c, 0..=3 for b.
    for (name, pages) in [("a", 5u64), ("b", 4), ("c", 5)] {
        let id = file(name);
        rig.progress.set_start(&worker(), &id).await?;
        let writer = rig.output_writer(name);

        for page in 0..pages {
            let lines: Vec<String> = (page * 10..(page + 1) * 10)
                .map(|i| delimited_line(usize::try_from(i).expect("small")))
                .collect();
            let cumulative = (page + 1) * 10;
            assert_eq!(
                writer.append_page(page, cumulative, &lines).await?,
                AppendOutcome::Appended
            );
            rig.progress
                .upsert_progress(&worker(), &id, page, cumulative)
                .await?;
        }
    }
    assert_eq!(rig.progress.min_outstanding_page(&worker()).await?, 3);

    // L1 died without releasing cleanly; its lease never existed here,
    // so L2 acquires immediately and resumes.
    run_to_completion(rig.orchestrator(), rig.publisher.clone(), 3).await?;

    // Extraction resumed at page 3 (b's last recorded page).
    assert_eq!(rig.reader.pages_read(), vec![3, 4, 5]);

    // No duplicates, no gaps, no markers.
    let expected: String = (0..60).map(|i| delimited_line(i) + "\n").collect();
    for name in ["a", "b", "c"] {
        let contents = tokio::fs::read_to_string(rig.output_path(name))
            .await
            .expect("readable");
        assert_eq!(contents, expected, "file {name}");
    }

    for event in rig.publisher.events()? {
        assert_eq!(event.total_rows, 60);
    }

    Ok(())
}

/// S4: a stale append attempt leaves the file and the progress store
/// untouched.
#[tokio::test]
async fn stale_duplicate_append_is_skipped() -> Result<()> {
    let rig = Rig::new(0, 10, &[("a", "delimited")]);
    let writer = rig.output_writer("a");

    let lines: Vec<String> = (0..3).map(delimited_line).collect();
    writer.append_page(10, 100_000, &lines).await?;
    let before = tokio::fs::read_to_string(rig.output_path("a"))
        .await
        .expect("readable");

    let outcome = writer.append_page(9, 90_000, &lines).await?;
    assert_eq!(outcome, AppendOutcome::SkippedStale);

    let after = tokio::fs::read_to_string(rig.output_path("a"))
        .await
        .expect("readable");
    assert_eq!(before, after);
    assert!(rig.progress.get(&file("a")).await?.is_none());

    Ok(())
}

/// S6: when renewal fails mid-extraction, the leader stops within one
/// page boundary, appends nothing further, and releases the lease.
#[tokio::test]
async fn heartbeat_loss_stops_within_one_page() -> Result<()> {
    /// Lease store whose renewals fail, and whose record vanishes,
    /// once the reader has served `fail_after_reads` pages.
    struct FaultInjectedLease {
        inner: Arc<InMemoryLeaseStore>,
        reader: Arc<InMemoryPageReader>,
        fail_after_reads: usize,
    }

    impl FaultInjectedLease {
        fn tripped(&self) -> bool {
            self.reader.reads() >= self.fail_after_reads
        }
    }

    #[async_trait]
    impl LeaseStore for FaultInjectedLease {
        async fn try_acquire(
            &self,
            worker_id: &WorkerId,
            instance_id: InstanceId,
            ttl: Duration,
        ) -> Result<bool> {
            if self.tripped() {
                return Ok(false);
            }
            self.inner.try_acquire(worker_id, instance_id, ttl).await
        }

        async fn renew(
            &self,
            worker_id: &WorkerId,
            instance_id: InstanceId,
            ttl: Duration,
        ) -> Result<bool> {
            if self.tripped() {
                return Ok(false);
            }
            self.inner.renew(worker_id, instance_id, ttl).await
        }

        async fn release(&self, worker_id: &WorkerId, instance_id: InstanceId) -> Result<()> {
            self.inner.release(worker_id, instance_id).await
        }

        async fn is_expired_or_unheld(&self, worker_id: &WorkerId) -> Result<bool> {
            self.inner.is_expired_or_unheld(worker_id).await
        }

        async fn get(&self, worker_id: &WorkerId) -> Result<Option<LeaseRecord>> {
            if self.tripped() {
                return Ok(None);
            }
            self.inner.get(worker_id).await
        }
    }

    let rig = Rig::new(100, 10, &[("a", "delimited")]);
    let faulty = Arc::new(FaultInjectedLease {
        inner: rig.lease.clone(),
        reader: rig.reader.clone(),
        fail_after_reads: 3,
    });

    let outputs = vec![OutputTarget::new(
        file("a"),
        "delimited",
        rig.dir.path(),
        "a.out",
    )];
    let trigger = Arc::new(ProgressTriggerGuard::new(
        rig.progress.clone() as Arc<dyn ProgressStore>,
        vec![file("a")],
        Duration::from_secs(86_400),
    ));
    let orchestrator = Orchestrator::new(
        worker(),
        InstanceId::generate(),
        test_policy(),
        EVENT_TYPE,
        outputs,
        Collaborators {
            lease: faulty,
            progress: rig.progress.clone(),
            reader: rig.reader.clone(),
            registry: Arc::new(TranslatorRegistry::with_defaults()),
            publisher: rig.publisher.clone(),
            trigger,
        },
        Arc::new(HealthState::new()),
    );

    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    handle.await.expect("join")?;

    // Pages 0..=2 were served; the fault tripped before page 3.
    assert_eq!(rig.reader.pages_read(), vec![0, 1, 2]);

    // Nothing past page 2 reached the file, and no finalization ran.
    let record = rig.progress.get(&file("a")).await?.expect("record");
    assert_eq!(record.status, FileStatus::InProgress);
    assert!(record.last_page <= 2);
    assert_eq!(rig.events().await, 0);

    let (marker_page, _) = OutputWriter::read_footer(&rig.output_path("a")).await;
    assert!(marker_page <= 2, "marker page {marker_page}");

    // The demoted leader released its lease.
    assert!(rig.lease.get(&worker()).await?.is_none());

    Ok(())
}

/// A publisher outage surfaces after finalizing the store record; the
/// run fails without rewinding the completion.
#[tokio::test]
async fn publish_failure_surfaces_after_completion() -> Result<()> {
    /// Publisher that always rejects.
    struct DownPublisher;

    #[async_trait]
    impl EventPublisher for DownPublisher {
        async fn publish_completed(
            &self,
            event: &nightjar_worker::publish::CompletionEvent,
        ) -> Result<()> {
            Err(nightjar_worker::error::Error::Publish {
                file_id: event.file_id.clone(),
                message: "broker unavailable".into(),
            })
        }
    }

    let rig = Rig::new(4, 2, &[("a", "delimited")]);
    let outputs = vec![OutputTarget::new(
        file("a"),
        "delimited",
        rig.dir.path(),
        "a.out",
    )];
    let trigger = Arc::new(ProgressTriggerGuard::new(
        rig.progress.clone() as Arc<dyn ProgressStore>,
        vec![file("a")],
        Duration::from_secs(86_400),
    ));
    let orchestrator = Orchestrator::new(
        worker(),
        InstanceId::generate(),
        test_policy(),
        EVENT_TYPE,
        outputs,
        Collaborators {
            lease: rig.lease.clone(),
            progress: rig.progress.clone(),
            reader: rig.reader.clone(),
            registry: Arc::new(TranslatorRegistry::with_defaults()),
            publisher: Arc::new(DownPublisher),
            trigger,
        },
        Arc::new(HealthState::new()),
    );

    let shutdown = CancellationToken::new();
    let error = orchestrator
        .run(shutdown)
        .await
        .expect_err("publish outage must surface");
    assert!(matches!(
        error,
        nightjar_worker::error::Error::Publish { .. }
    ));

    // Completion stands; operators re-emit from the progress store.
    let record = rig.progress.get(&file("a")).await?.expect("record");
    assert_eq!(record.status, FileStatus::Completed);
    assert_eq!(record.cumulative_rows, 4);

    // The file itself is published on disk (marker removed).
    let contents = tokio::fs::read_to_string(rig.output_path("a"))
        .await
        .expect("readable");
    assert_eq!(contents.lines().count(), 4);

    // The lease was released on the failure path.
    assert!(rig.lease.get(&worker()).await?.is_none());

    Ok(())
}
