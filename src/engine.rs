//! Hybrid storage engine
//!
//! The public control surface. Writes land on the local store synchronously
//! (callers see local latency only) and are enqueued for asynchronous
//! propagation to the remote store. Sync failures never reach foreground
//! callers; they surface through `status()`, logs and dead letters.

use std::sync::Arc;

use crate::error::{MnemonError, Result};
use crate::store::{LocalStore, RemoteStore};
use crate::sync::{
    CapacityGuard, DriftDetector, DriftReport, ReconcileReport, Reconciler, SyncContext,
    SyncQueue, SyncStatusHandle, SyncWorker,
};
use crate::types::{
    compute_content_hash, normalize_memory_type, normalize_tags, DeadLetter, HybridConfig, Memory,
    PartialUpdate, SyncPayload, SyncStatus,
};

/// Hybrid local/remote memory store
///
/// ```rust,ignore
/// use mnemon::{HybridEngine, HybridConfig, Memory};
/// use mnemon::store::{SqliteStore, HttpRemoteStore, HttpRemoteConfig};
/// use std::sync::Arc;
///
/// let local = Arc::new(SqliteStore::open("memories.db")?);
/// let remote = Arc::new(HttpRemoteStore::new(HttpRemoteConfig {
///     base_url: "https://memories.example.com/v1".into(),
///     api_token: std::env::var("MNEMON_TOKEN").ok(),
///     timeout_secs: 30,
/// })?);
/// let engine = HybridEngine::start(local, remote, HybridConfig {
///     queue_path: "sync-queue.db".into(),
///     ..Default::default()
/// })?;
///
/// engine.put(Memory::new("prefers dark mode", "preference", vec![], Default::default()))?;
/// ```
pub struct HybridEngine {
    ctx: SyncContext,
    worker: Option<SyncWorker>,
}

impl HybridEngine {
    /// Build the engine and, when this process is the sync owner, spawn the
    /// background worker (which runs the startup reconciliation pass when
    /// configured). Non-owner processes enqueue but never drain.
    pub fn start(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: HybridConfig,
    ) -> Result<Self> {
        let queue = SyncQueue::open(&config.queue_path)?;
        let status = SyncStatusHandle::new();
        status.update(|s| {
            s.pending_count = queue.pending_count().unwrap_or(0);
            s.failed_count = queue.dead_letter_count().unwrap_or(0);
        });

        let guard = Arc::new(CapacityGuard::new(
            remote.clone(),
            config.capacity_refresh(),
            config.capacity_soft_pct,
            config.capacity_hard_pct,
        ));

        let ctx = SyncContext {
            local,
            remote,
            queue,
            status,
            guard,
            config,
        };

        let worker = if ctx.config.sync_owner {
            Some(SyncWorker::start(ctx.clone()))
        } else {
            tracing::info!("Not the sync owner, queueing without draining");
            None
        };

        Ok(Self { ctx, worker })
    }

    /// Store a memory: synchronous local write, async remote propagation.
    ///
    /// Local failures propagate; once this returns Ok the write is durable
    /// locally and queued for the remote. Returns the normalized record.
    pub fn put(&self, mut memory: Memory) -> Result<Memory> {
        memory.memory_type = normalize_memory_type(&memory.memory_type, &self.ctx.config.taxonomy)
            .map_err(|e| MnemonError::InvalidInput(e.to_string()))?;
        memory.tags = normalize_tags(memory.tags);
        if memory.content.len() > self.ctx.config.max_content_length {
            return Err(MnemonError::InvalidInput(format!(
                "Content length {} exceeds maximum {}",
                memory.content.len(),
                self.ctx.config.max_content_length
            )));
        }
        memory.content_hash = compute_content_hash(&memory.content);

        // First successful store owns created_at for good
        if let Some(existing) = self.ctx.local.get(&memory.content_hash)? {
            memory.created_at = existing.created_at;
        }

        self.ctx.local.put(&memory)?;
        let hash = memory.content_hash.clone();
        self.ctx.queue.enqueue(
            &hash,
            SyncPayload::Store {
                memory: memory.clone(),
            },
        )?;
        self.after_write();
        Ok(memory)
    }

    /// Read straight from the local store; never touches the network.
    pub fn get(&self, content_hash: &str) -> Result<Option<Memory>> {
        self.ctx.local.get(content_hash)
    }

    /// Delete locally and enqueue the remote delete.
    pub fn delete(&self, content_hash: &str) -> Result<()> {
        self.ctx.local.delete(content_hash)?;
        self.ctx.queue.enqueue(content_hash, SyncPayload::Delete)?;
        self.after_write();
        Ok(())
    }

    /// Apply many metadata updates in one local transaction and enqueue the
    /// remote propagation as coalesced entries; the worker ships them in
    /// batch-sized remote calls, never one round-trip per record.
    /// `created_at` is untouched throughout. Returns how many local records
    /// were updated.
    pub fn batch_update_metadata(&self, updates: Vec<PartialUpdate>) -> Result<usize> {
        let mut normalized = Vec::with_capacity(updates.len());
        for mut update in updates {
            if let Some(memory_type) = &update.memory_type {
                update.memory_type = Some(
                    normalize_memory_type(memory_type, &self.ctx.config.taxonomy)
                        .map_err(|e| MnemonError::InvalidInput(e.to_string()))?,
                );
            }
            if let Some(tags) = update.tags.take() {
                update.tags = Some(normalize_tags(tags));
            }
            normalized.push(update);
        }

        let applied = self.ctx.local.update_metadata_batch(&normalized)?;
        for update in normalized {
            let hash = update.content_hash.clone();
            self.ctx
                .queue
                .enqueue(&hash, SyncPayload::UpdateMetadata { update })?;
        }
        self.after_write();
        Ok(applied)
    }

    /// Snapshot of the sync pipeline state (a copy, never a live reference).
    pub fn status(&self) -> SyncStatus {
        let mut snapshot = self.ctx.status.snapshot();
        if let Ok(pending) = self.ctx.queue.pending_count() {
            snapshot.pending_count = pending;
        }
        if let Ok(failed) = self.ctx.queue.dead_letter_count() {
            snapshot.failed_count = failed;
        }
        snapshot
    }

    /// Suppress scheduled sync ticks. Safe while a cycle is in flight: the
    /// running cycle completes, the next tick is skipped.
    pub fn pause(&self) {
        self.ctx.status.update(|s| s.paused = true);
        tracing::info!("Sync paused");
    }

    /// Re-enable scheduled sync ticks.
    pub fn resume(&self) {
        self.ctx.status.update(|s| s.paused = false);
        tracing::info!("Sync resumed");
    }

    /// Trigger an immediate out-of-schedule cycle. Allowed while paused and
    /// does not resume periodic ticking.
    pub fn force_sync(&self) {
        match &self.worker {
            Some(worker) => worker.force_sync(),
            None => tracing::warn!("force_sync ignored, this process is not the sync owner"),
        }
    }

    /// Like [`force_sync`], resolving when the cycle completes.
    ///
    /// [`force_sync`]: HybridEngine::force_sync
    pub async fn force_sync_and_wait(&self) -> Result<()> {
        match &self.worker {
            Some(worker) => worker.force_sync_and_wait().await,
            None => Err(MnemonError::Sync(
                "This process is not the sync owner".to_string(),
            )),
        }
    }

    /// Run a reconciliation pass now (also runs at startup when configured).
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        Reconciler::new(self.ctx.clone()).run().await
    }

    /// Run one drift-detection batch. With `dry_run`, report intended fixes
    /// without applying them.
    pub async fn drift_check(&self, dry_run: bool) -> Result<DriftReport> {
        DriftDetector::new(self.ctx.clone()).run_batch(dry_run).await
    }

    /// Most recent dead-lettered operations for operator inspection.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.ctx.queue.dead_letters(limit)
    }

    /// Stop the worker after one final bounded drain. Entries that do not
    /// make it out within the grace period stay in the durable queue for the
    /// next startup.
    pub async fn shutdown(&self) -> Result<()> {
        match &self.worker {
            Some(worker) => worker.stop().await,
            None => Ok(()),
        }
    }

    fn after_write(&self) {
        if let Ok(pending) = self.ctx.queue.pending_count() {
            self.ctx.status.update(|s| s.pending_count = pending);
        }
        if let Some(worker) = &self.worker {
            worker.nudge();
        }
    }
}
