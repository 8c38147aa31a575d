//! In-memory lease store implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No cross-process coordination
//! - **Single-process only**: Leadership is not shared across process
//!   boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use nightjar_core::{InstanceId, WorkerId};

use super::{LeaseRecord, LeaseStore};
use crate::error::{Error, Result};

/// In-memory lease store for testing.
///
/// Implements the same conditional-write semantics as the production
/// store using `RwLock` for synchronization.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: RwLock<HashMap<WorkerId, LeaseRecord>>,
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

fn ttl_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120))
}

impl InMemoryLeaseStore {
    /// Creates a new empty lease store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        worker_id: &WorkerId,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(existing) = leases.get(worker_id) {
            if !existing.is_expired_at(now) && existing.instance_id != instance_id {
                return Ok(false);
            }
        }

        leases.insert(
            worker_id.clone(),
            LeaseRecord {
                worker_id: worker_id.clone(),
                instance_id,
                acquired_at: now,
                expires_at: now + ttl_chrono(ttl),
            },
        );

        Ok(true)
    }

    async fn renew(
        &self,
        worker_id: &WorkerId,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        let Some(existing) = leases.get_mut(worker_id) else {
            return Ok(false);
        };

        if existing.instance_id != instance_id {
            return Ok(false);
        }

        existing.expires_at = now + ttl_chrono(ttl);
        Ok(true)
    }

    async fn release(&self, worker_id: &WorkerId, instance_id: InstanceId) -> Result<()> {
        let mut leases = self.leases.write().map_err(poison_err)?;

        if let Some(existing) = leases.get(worker_id) {
            if existing.instance_id == instance_id {
                leases.remove(worker_id);
            }
        }

        Ok(())
    }

    async fn is_expired_or_unheld(&self, worker_id: &WorkerId) -> Result<bool> {
        let leases = self.leases.read().map_err(poison_err)?;
        let now = Utc::now();

        Ok(leases
            .get(worker_id)
            .is_none_or(|record| record.is_expired_at(now)))
    }

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<LeaseRecord>> {
        let leases = self.leases.read().map_err(poison_err)?;
        Ok(leases.get(worker_id).cloned())
    }
}
