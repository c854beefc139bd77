//! Workflow leases
//!
//! A lease marks a workflow execution as owned. The epoch starts at zero and
//! advances once per completed step. `LeaseGuard` releases exactly once:
//! explicitly through [`LeaseGuard::release`], or on drop when the owning
//! future is cancelled.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{HostError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub workflow_id: Uuid,
    pub lease_id: Uuid,
    pub epoch: u64,
}

/// Active leases keyed by workflow id
#[derive(Debug, Default)]
pub struct LeaseTable {
    active: Mutex<HashMap<Uuid, Uuid>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, workflow_id: Uuid) -> Result<LeaseGuard> {
        let lease_id = Uuid::new_v4();
        {
            let mut active = self.active.lock();
            if active.contains_key(&workflow_id) {
                return Err(HostError::LeaseConflict {
                    workflow_id: workflow_id.to_string(),
                });
            }
            active.insert(workflow_id, lease_id);
        }
        self.acquired.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%workflow_id, %lease_id, "lease acquired");

        Ok(LeaseGuard {
            table: Arc::clone(self),
            lease: Lease {
                workflow_id,
                lease_id,
                epoch: 0,
            },
            released: false,
        })
    }

    pub fn is_held(&self, workflow_id: &Uuid) -> bool {
        self.active.lock().contains_key(workflow_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    fn release(&self, lease: &Lease) {
        let mut active = self.active.lock();
        if active.get(&lease.workflow_id) == Some(&lease.lease_id) {
            active.remove(&lease.workflow_id);
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Owned lease; released exactly once
#[derive(Debug)]
pub struct LeaseGuard {
    table: Arc<LeaseTable>,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn epoch(&self) -> u64 {
        self.lease.epoch
    }

    /// Record a completed step
    pub fn advance(&mut self) -> u64 {
        self.lease.epoch += 1;
        self.lease.epoch
    }

    pub fn release(mut self) -> Lease {
        self.released = true;
        self.table.release(&self.lease);
        tracing::debug!(
            workflow_id = %self.lease.workflow_id,
            epoch = self.lease.epoch,
            "lease released"
        );
        self.lease.clone()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                workflow_id = %self.lease.workflow_id,
                epoch = self.lease.epoch,
                "lease force-released"
            );
            self.table.release(&self.lease);
        }
    }
}
