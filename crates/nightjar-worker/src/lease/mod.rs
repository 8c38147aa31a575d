//! Single-writer lease for distributed worker coordination.
//!
//! The [`LeaseStore`] trait provides a durable, TTL-expiring mutex keyed
//! by worker identity, separate from progress tracking. This separation
//! enables:
//!
//! - **Testing**: Use [`memory::InMemoryLeaseStore`] for unit tests
//! - **Production**: Use [`postgres::PostgresLeaseStore`]
//! - **Flexibility**: Switch implementations without touching the
//!   orchestrator
//!
//! ## Design Principles
//!
//! - **Leases, not locks**: the holder has a time-bounded right to act;
//!   correctness does not depend on prompt expiry of stale records
//! - **Heartbeat renewal**: the leader must renew periodically or lose
//!   leadership
//! - **Safety bias**: when an implementation cannot tell whether an
//!   acquisition or renewal succeeded, it must report failure. Losing
//!   leadership is recoverable; falsely claiming it is not
//!
//! ## Safety
//!
//! At most one unexpired record may exist per worker. Every write to an
//! output file happens under a held lease, so a single writer is active
//! at any time across the fleet.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nightjar_core::{InstanceId, WorkerId};

use crate::error::Result;

/// One lease record, at most one per worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// The workload the lease belongs to.
    pub worker_id: WorkerId,
    /// The replica currently holding the lease.
    pub instance_id: InstanceId,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Returns true when the lease has expired at the given instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns true when the lease is held by the given replica and
    /// unexpired at the given instant.
    #[must_use]
    pub fn is_held_by(&self, instance_id: InstanceId, now: DateTime<Utc>) -> bool {
        self.instance_id == instance_id && !self.is_expired_at(now)
    }
}

/// Durable, TTL-expiring single-holder mutex keyed by worker identity.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// orchestrator loop and the heartbeat task.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Attempts to acquire the lease for a worker.
    ///
    /// Atomically: if no record exists, or the existing record has
    /// expired, replace it with a fresh record naming `instance_id` and
    /// return true; otherwise return false.
    ///
    /// Transient store failures are reported as "not acquired", never
    /// as an acquisition.
    async fn try_acquire(
        &self,
        worker_id: &WorkerId,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<bool>;

    /// Extends the lease expiry, only where both identities still match.
    ///
    /// Returns true iff exactly one record was modified. Transient
    /// store failures are reported as "not renewed".
    async fn renew(
        &self,
        worker_id: &WorkerId,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<bool>;

    /// Deletes the lease where both identities match.
    ///
    /// A missing record is not an error; releasing a lease another
    /// replica took over leaves theirs intact.
    async fn release(&self, worker_id: &WorkerId, instance_id: InstanceId) -> Result<()>;

    /// Returns true when no record exists or the record has expired.
    async fn is_expired_or_unheld(&self, worker_id: &WorkerId) -> Result<bool>;

    /// Diagnostic read of the current lease record, if any.
    async fn get(&self, worker_id: &WorkerId) -> Result<Option<LeaseRecord>>;
}
