//! Lease heartbeat task.
//!
//! While a replica leads, a background task renews the lease every
//! heartbeat interval. A renewal that returns false (or fails) means
//! leadership is gone: the task cancels the leader-scoped token, and
//! the extraction loop observes the signal at its next page boundary
//! and winds down cleanly. The TTL is several intervals wide, so one
//! slow renewal does not cost leadership.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nightjar_core::{InstanceId, WorkerId};

use crate::lease::LeaseStore;
use crate::metrics::WorkerMetrics;

/// Handle to a running heartbeat task.
pub(crate) struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawns the renewal loop for a freshly acquired lease.
    ///
    /// The loop exits when `leader_token` is cancelled from above or
    /// when a renewal fails, in which case it cancels `leader_token`
    /// itself.
    pub(crate) fn spawn(
        lease: Arc<dyn LeaseStore>,
        worker_id: WorkerId,
        instance_id: InstanceId,
        interval: Duration,
        ttl: Duration,
        leader_token: CancellationToken,
        metrics: WorkerMetrics,
    ) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = leader_token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        let renewed = match lease.renew(&worker_id, instance_id, ttl).await {
                            Ok(renewed) => renewed,
                            Err(error) => {
                                tracing::warn!(
                                    worker_id = %worker_id,
                                    error = %error,
                                    "lease renewal errored; treating as not renewed"
                                );
                                false
                            }
                        };

                        if renewed {
                            tracing::trace!(worker_id = %worker_id, "lease renewed");
                        } else {
                            tracing::warn!(
                                worker_id = %worker_id,
                                instance_id = %instance_id,
                                "lease renewal failed; abandoning leadership"
                            );
                            metrics.record_renewal_failure();
                            leader_token.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Self { handle }
    }

    /// Stops the renewal loop and waits for it to finish.
    pub(crate) async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}
