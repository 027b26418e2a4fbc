//! Remote capacity guard
//!
//! Pre-flight check that keeps the worker from slamming into remote quota
//! errors. The snapshot is cached and refreshed on an interval, not fetched
//! per send.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::store::{CapacitySnapshot, RemoteStore};

/// What the worker should do given current remote capacity
#[derive(Debug, Clone, Copy)]
pub struct CapacityDecision {
    /// Last known usage percentage, if any reading succeeded
    pub used_pct: Option<f32>,
    /// Soft threshold crossed: report, keep syncing normally
    pub soft_warning: bool,
    /// Hard threshold crossed (or the remote reports its hard limit hit):
    /// shrink batches, suppress background passes
    pub degraded: bool,
}

impl CapacityDecision {
    /// Batch size to use this cycle. Degraded mode quarters the configured
    /// size, never below one; foreground local writes are unaffected.
    pub fn effective_batch(&self, configured: usize) -> usize {
        if self.degraded {
            (configured / 4).max(1)
        } else {
            configured.max(1)
        }
    }

    /// Background passes (reconciliation, drift) run only when not degraded.
    pub fn allow_background(&self) -> bool {
        !self.degraded
    }
}

/// Cached remote-capacity checker
pub struct CapacityGuard {
    remote: Arc<dyn RemoteStore>,
    cached: Mutex<Option<(Instant, CapacitySnapshot)>>,
    refresh: Duration,
    soft_pct: f32,
    hard_pct: f32,
}

impl CapacityGuard {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        refresh: Duration,
        soft_pct: f32,
        hard_pct: f32,
    ) -> Self {
        Self {
            remote,
            cached: Mutex::new(None),
            refresh,
            soft_pct,
            hard_pct,
        }
    }

    /// Current decision, refreshing the snapshot when stale. A failed
    /// reading keeps the previous snapshot (or none); capacity checks must
    /// never block the sync path on their own errors.
    pub async fn decision(&self) -> CapacityDecision {
        let fresh = {
            let cached = self.cached.lock();
            match cached.as_ref() {
                Some((at, _)) => at.elapsed() < self.refresh,
                None => false,
            }
        };

        if !fresh {
            match self.remote.capacity().await {
                Ok(snapshot) => {
                    *self.cached.lock() = Some((Instant::now(), snapshot));
                }
                Err(e) => {
                    tracing::debug!("Capacity check failed, keeping last snapshot: {}", e);
                }
            }
        }

        let snapshot = self.cached.lock().as_ref().map(|(_, s)| *s);
        self.decide(snapshot)
    }

    fn decide(&self, snapshot: Option<CapacitySnapshot>) -> CapacityDecision {
        match snapshot {
            None => CapacityDecision {
                used_pct: None,
                soft_warning: false,
                degraded: false,
            },
            Some(s) => CapacityDecision {
                used_pct: Some(s.used_pct),
                soft_warning: s.used_pct >= self.soft_pct,
                degraded: s.hard_limit_hit || s.used_pct >= self.hard_pct,
            },
        }
    }

    /// Drop the cached snapshot so the next decision re-reads capacity.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
