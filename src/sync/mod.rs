//! Hybrid store synchronization
//!
//! Everything that keeps the local and remote stores converging: the durable
//! sync queue, the background worker, the startup reconciliation pass, the
//! drift detector, and the capacity guard. Foreground write latency never
//! depends on anything in this module.

mod capacity;
mod drift;
mod queue;
mod reconcile;
mod worker;

pub use capacity::{CapacityDecision, CapacityGuard};
pub use drift::{DriftDetector, DriftFix, DriftReport, DriftSide};
pub use queue::SyncQueue;
pub use reconcile::{ReconcileReport, Reconciler};
pub use worker::{backoff_delay, SyncCommand, SyncWorker};

use parking_lot::Mutex;
use std::sync::Arc;

use crate::store::{LocalStore, RemoteStore};
use crate::types::{HybridConfig, SyncStatus};

/// Everything the sync machinery needs, bundled for cheap cloning into the
/// worker task and the background passes.
#[derive(Clone)]
pub struct SyncContext {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub queue: SyncQueue,
    pub status: SyncStatusHandle,
    pub guard: Arc<CapacityGuard>,
    pub config: HybridConfig,
}

/// Shared handle to the process-wide sync status.
///
/// The worker and the controller mutate it through [`update`]; everyone else
/// gets a snapshot copy from [`snapshot`], never a live reference.
///
/// [`update`]: SyncStatusHandle::update
/// [`snapshot`]: SyncStatusHandle::snapshot
#[derive(Clone, Default)]
pub struct SyncStatusHandle {
    inner: Arc<Mutex<SyncStatus>>,
}

impl SyncStatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> SyncStatus {
        self.inner.lock().clone()
    }

    /// Mutate the status under the lock.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        let mut status = self.inner.lock();
        f(&mut status);
    }
}
