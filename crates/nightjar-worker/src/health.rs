//! Readiness and liveness surfaces.
//!
//! - **Readiness** exercises the worker's external dependencies: lease
//!   store, progress store, and source view (via the total row count).
//! - **Liveness** checks that a leading replica is still making
//!   progress: a leader whose last recorded page is older than the
//!   liveness window is reported unhealthy so the host can restart it.
//!   Followers are always live.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use nightjar_core::WorkerId;

use crate::lease::LeaseStore;
use crate::progress::ProgressStore;
use crate::reader::PageReader;

/// Default window within which a leader must have recorded progress.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Default, Clone, Copy)]
struct HealthSnapshot {
    is_leader: bool,
    last_progress_at: Option<DateTime<Utc>>,
}

/// Shared liveness state updated by the orchestrator at page
/// boundaries.
#[derive(Debug, Default)]
pub struct HealthState {
    inner: RwLock<HealthSnapshot>,
}

impl HealthState {
    /// Creates a fresh state (follower, no progress yet).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags whether this replica currently leads.
    pub fn set_leader(&self, is_leader: bool) {
        if let Ok(mut inner) = self.inner.write() {
            inner.is_leader = is_leader;
            if !is_leader {
                inner.last_progress_at = None;
            }
        }
    }

    /// Records a progress heartbeat (one page fanned out).
    pub fn record_progress(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.last_progress_at = Some(Utc::now());
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        self.inner.read().map(|inner| *inner).unwrap_or_default()
    }
}

/// Health probe service wired to the worker's collaborators.
pub struct HealthService {
    worker_id: WorkerId,
    lease: Arc<dyn LeaseStore>,
    progress: Arc<dyn ProgressStore>,
    reader: Arc<dyn PageReader>,
    state: Arc<HealthState>,
    liveness_window: Duration,
}

/// JSON body returned by both probes.
#[derive(Debug, Serialize)]
struct ProbeReport {
    status: &'static str,
    worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_rows: Option<u64>,
    is_leader: bool,
}

impl HealthService {
    /// Creates a probe service.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        lease: Arc<dyn LeaseStore>,
        progress: Arc<dyn ProgressStore>,
        reader: Arc<dyn PageReader>,
        state: Arc<HealthState>,
    ) -> Self {
        Self {
            worker_id,
            lease,
            progress,
            reader,
            state,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }

    /// Overrides the liveness window.
    #[must_use]
    pub const fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Builds the axum router serving `/health/ready` and
    /// `/health/live`.
    #[must_use]
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health/ready", get(ready_handler))
            .route("/health/live", get(live_handler))
            .with_state(self)
    }

    async fn readiness(&self) -> Response {
        let snapshot = self.state.snapshot();

        if let Err(error) = self.lease.get(&self.worker_id).await {
            return probe_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &self.worker_id,
                snapshot.is_leader,
                Some(format!("lease store unreachable: {error}")),
                None,
            );
        }

        if let Err(error) = self.progress.list_by_worker(&self.worker_id).await {
            return probe_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &self.worker_id,
                snapshot.is_leader,
                Some(format!("progress store unreachable: {error}")),
                None,
            );
        }

        match self.reader.total_rows().await {
            Ok(total) => probe_response(
                StatusCode::OK,
                &self.worker_id,
                snapshot.is_leader,
                None,
                Some(total),
            ),
            Err(error) => probe_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &self.worker_id,
                snapshot.is_leader,
                Some(format!("source view unreachable: {error}")),
                None,
            ),
        }
    }

    async fn liveness(&self) -> Response {
        let snapshot = self.state.snapshot();

        if !snapshot.is_leader {
            return probe_response(StatusCode::OK, &self.worker_id, false, None, None);
        }

        let stalled = snapshot.last_progress_at.is_some_and(|at| {
            (Utc::now() - at)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.liveness_window)
        });

        if stalled {
            probe_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &self.worker_id,
                true,
                Some("leader has not recorded progress within the liveness window".to_string()),
                None,
            )
        } else {
            probe_response(StatusCode::OK, &self.worker_id, true, None, None)
        }
    }
}

fn probe_response(
    status: StatusCode,
    worker_id: &WorkerId,
    is_leader: bool,
    detail: Option<String>,
    total_rows: Option<u64>,
) -> Response {
    let report = ProbeReport {
        status: if status == StatusCode::OK {
            "ok"
        } else {
            "unavailable"
        },
        worker_id: worker_id.to_string(),
        detail,
        total_rows,
        is_leader,
    };
    (status, Json(report)).into_response()
}

async fn ready_handler(State(service): State<Arc<HealthService>>) -> Response {
    service.readiness().await
}

async fn live_handler(State(service): State<Arc<HealthService>>) -> Response {
    service.liveness().await
}
