//! Background sync worker
//!
//! One long-lived task per process drains the durable queue toward the
//! remote store. Cycles run on a periodic tick, on a debounced nudge after
//! foreground writes, and on demand via force-sync; the single task
//! serializes them so cycles never overlap. Foreground reads and writes
//! never wait on anything here.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::{DriftDetector, Reconciler, SyncContext};
use crate::error::{MnemonError, RemoteError, Result, SyncErrorClass};
use crate::store::RemoteStore;
use crate::types::{ContentHash, Memory, SyncPayload, SyncQueueEntry};

/// Commands accepted by the worker task
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a cycle now, regardless of pause state. The optional channel is
    /// signalled when the cycle finishes
    Sync { done: Option<oneshot::Sender<()>> },
    /// A foreground write happened; run a cycle once writes quiet down
    Nudge,
    /// Final bounded drain, then exit
    Stop { done: Option<oneshot::Sender<()>> },
}

/// Handle to the background sync worker
pub struct SyncWorker {
    sender: mpsc::Sender<SyncCommand>,
}

impl SyncWorker {
    /// Spawn the worker task.
    pub(crate) fn start(ctx: SyncContext) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SyncCommand>(64);

        tokio::spawn(async move {
            if ctx.config.reconcile_on_startup {
                match Reconciler::new(ctx.clone()).run().await {
                    Ok(report) => tracing::info!(
                        pulled = report.pulled,
                        pushed = report.pushed,
                        drift_flagged = report.drift_flagged,
                        "Startup reconciliation complete"
                    ),
                    Err(e) => tracing::warn!("Startup reconciliation failed: {}", e),
                }
            }

            let tick_period = ctx.config.tick_interval();
            let mut tick = interval_at(Instant::now() + tick_period, tick_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let drift_period = ctx.config.drift_interval();
            let mut drift_tick = interval_at(Instant::now() + drift_period, drift_period);
            drift_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut nudge_check = interval(Duration::from_millis(500));
            nudge_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_nudge: Option<Instant> = None;

            loop {
                tokio::select! {
                    Some(cmd) = receiver.recv() => match cmd {
                        SyncCommand::Sync { done } => {
                            run_cycle(&ctx, None).await;
                            last_nudge = None;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                        }
                        SyncCommand::Nudge => {
                            last_nudge = Some(Instant::now());
                        }
                        SyncCommand::Stop { done } => {
                            let deadline = Instant::now() + ctx.config.shutdown_grace();
                            run_cycle(&ctx, Some(deadline)).await;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                            break;
                        }
                    },
                    _ = tick.tick() => {
                        if !ctx.status.snapshot().paused {
                            run_cycle(&ctx, None).await;
                            last_nudge = None;
                        }
                    }
                    _ = drift_tick.tick() => {
                        if !ctx.status.snapshot().paused {
                            let decision = ctx.guard.decision().await;
                            if decision.allow_background() {
                                match DriftDetector::new(ctx.clone()).run_batch(false).await {
                                    Ok(report) if !report.fixes.is_empty() => tracing::info!(
                                        checked = report.checked,
                                        fixes = report.fixes.len(),
                                        "Drift pass applied fixes"
                                    ),
                                    Ok(_) => {}
                                    Err(e) => tracing::warn!("Drift pass failed: {}", e),
                                }
                            }
                        }
                    }
                    _ = nudge_check.tick() => {
                        if let Some(at) = last_nudge {
                            if at.elapsed() >= ctx.config.nudge_debounce()
                                && !ctx.status.snapshot().paused
                            {
                                run_cycle(&ctx, None).await;
                                last_nudge = None;
                            }
                        }
                    }
                }
            }

            tracing::info!("Sync worker stopped");
        });

        Self { sender }
    }

    /// Request an out-of-schedule cycle. Runs even while paused and does not
    /// resume periodic ticking.
    pub fn force_sync(&self) {
        if self
            .sender
            .try_send(SyncCommand::Sync { done: None })
            .is_err()
        {
            tracing::warn!("Sync worker channel full or closed, force-sync dropped");
        }
    }

    /// Like [`force_sync`], but resolves when the cycle completes.
    ///
    /// [`force_sync`]: SyncWorker::force_sync
    pub async fn force_sync_and_wait(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SyncCommand::Sync { done: Some(tx) })
            .await
            .map_err(|_| MnemonError::Sync("Worker channel closed".to_string()))?;
        rx.await
            .map_err(|_| MnemonError::Sync("Worker stopped mid-cycle".to_string()))
    }

    /// Debounced cycle request after a foreground write. Never blocks.
    pub fn nudge(&self) {
        let _ = self.sender.try_send(SyncCommand::Nudge);
    }

    /// Final bounded drain, then the worker exits. Remaining entries stay in
    /// the durable queue for the next startup.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SyncCommand::Stop { done: Some(tx) })
            .await
            .map_err(|_| MnemonError::Sync("Worker channel closed".to_string()))?;
        rx.await
            .map_err(|_| MnemonError::Sync("Worker stopped before final drain".to_string()))
    }
}

/// Exponential backoff delay for the given attempt number (1-based):
/// `min(base * 2^(attempt-1), cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ms = (base.as_millis() as u64).saturating_mul(1u64 << exp);
    Duration::from_millis(ms).min(cap)
}

#[derive(Default)]
struct CycleStats {
    acked: usize,
    rescheduled: usize,
    dead_lettered: usize,
    had_temporary: bool,
}

/// One full cycle: drain due entries, batch, send, classify failures.
///
/// `deadline` bounds the shutdown drain; individual remote calls still run
/// to their own timeouts rather than being cancelled mid-call.
pub(crate) async fn run_cycle(ctx: &SyncContext, deadline: Option<Instant>) {
    ctx.status.update(|s| s.actively_syncing = true);

    let decision = ctx.guard.decision().await;
    ctx.status
        .update(|s| s.remote_capacity_used_pct = decision.used_pct);
    if decision.degraded {
        tracing::warn!(
            used_pct = ?decision.used_pct,
            "Remote capacity above hard threshold, shrinking batches"
        );
    } else if decision.soft_warning {
        tracing::warn!(used_pct = ?decision.used_pct, "Remote capacity above soft threshold");
    }
    let batch_size = decision.effective_batch(ctx.config.batch_size);

    let mut stats = CycleStats::default();
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                tracing::warn!("Shutdown grace exhausted, remaining entries stay queued");
                break;
            }
        }
        let entries = match ctx.queue.drain(batch_size, Utc::now()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Queue drain failed: {}", e);
                ctx.status.update(|s| s.last_error = Some(e.to_string()));
                break;
            }
        };
        if entries.is_empty() {
            break;
        }
        process_entries(ctx, entries, &mut stats).await;
        if stats.had_temporary {
            // The remote is struggling; let backoff and the next tick take
            // over instead of hammering it within one cycle
            break;
        }
    }

    let pending = ctx.queue.pending_count().ok();
    let failed = ctx.queue.dead_letter_count().ok();
    ctx.status.update(|s| {
        if let Some(pending) = pending {
            s.pending_count = pending;
        }
        if let Some(failed) = failed {
            s.failed_count = failed;
        }
        s.actively_syncing = false;
        if stats.had_temporary {
            s.last_error = Some("remote temporarily unavailable, backing off".to_string());
        } else {
            s.last_sync_at = Some(Utc::now());
            s.last_error = None;
        }
    });

    if stats.acked > 0 || stats.rescheduled > 0 || stats.dead_lettered > 0 {
        tracing::info!(
            acked = stats.acked,
            rescheduled = stats.rescheduled,
            dead_lettered = stats.dead_lettered,
            "Sync cycle complete"
        );
    }
}

async fn process_entries(ctx: &SyncContext, entries: Vec<SyncQueueEntry>, stats: &mut CycleStats) {
    let mut puts: Vec<(SyncQueueEntry, Memory)> = Vec::new();
    let mut deletes: Vec<SyncQueueEntry> = Vec::new();

    for entry in entries {
        match &entry.payload {
            SyncPayload::Store { memory } => {
                let memory = memory.clone();
                puts.push((entry, memory));
            }
            SyncPayload::UpdateMetadata { .. } => {
                // The local store already carries the update; ship its
                // current state rather than replaying the delta
                match ctx.local.get(&entry.content_hash) {
                    Ok(Some(memory)) => puts.push((entry, memory)),
                    Ok(None) => {
                        // Record vanished locally, nothing left to propagate
                        let _ = ctx.queue.ack(entry.id, entry.revision);
                    }
                    Err(e) => {
                        tracing::warn!(
                            content_hash = %entry.content_hash,
                            "Skipping entry, local read failed: {}",
                            e
                        );
                    }
                }
            }
            SyncPayload::Delete => deletes.push(entry),
        }
    }

    if !puts.is_empty() {
        let memories: Vec<Memory> = puts.iter().map(|(_, m)| m.clone()).collect();
        let results = send_put_batch(ctx.remote.as_ref(), &memories).await;
        for (entry, memory) in &puts {
            match results.get(&memory.content_hash) {
                Some(Ok(())) => {
                    if ctx.queue.ack(entry.id, entry.revision).unwrap_or(false) {
                        stats.acked += 1;
                    }
                }
                Some(Err(e)) => handle_failure(ctx, entry, e, stats),
                None => {}
            }
        }
    }

    if !deletes.is_empty() {
        let hashes: Vec<ContentHash> = deletes.iter().map(|e| e.content_hash.clone()).collect();
        match ctx.remote.delete_batch(&hashes).await {
            Ok(outcome) => {
                for entry in &deletes {
                    match outcome.errors.get(&entry.content_hash) {
                        Some(e) => handle_failure(ctx, entry, e, stats),
                        None => {
                            if ctx.queue.ack(entry.id, entry.revision).unwrap_or(false) {
                                stats.acked += 1;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                for entry in &deletes {
                    handle_failure(ctx, entry, &e, stats);
                }
            }
        }
    }
}

/// Send an upsert batch, splitting in half on batch-level limit errors so an
/// oversized payload degrades to smaller requests instead of dead-lettering
/// entries that would fit on their own.
fn send_put_batch<'a>(
    remote: &'a dyn RemoteStore,
    memories: &'a [Memory],
) -> BoxFuture<'a, HashMap<ContentHash, std::result::Result<(), RemoteError>>> {
    Box::pin(async move {
        let mut results = HashMap::new();
        if memories.is_empty() {
            return results;
        }
        match remote.put_batch(memories).await {
            Ok(outcome) => {
                for memory in memories {
                    let result = match outcome.errors.get(&memory.content_hash) {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    };
                    results.insert(memory.content_hash.clone(), result);
                }
            }
            Err(e) if e.class == SyncErrorClass::Limit && memories.len() > 1 => {
                tracing::info!(
                    batch = memories.len(),
                    "Batch hit a limit error, splitting: {}",
                    e
                );
                let mid = memories.len() / 2;
                results.extend(send_put_batch(remote, &memories[..mid]).await);
                results.extend(send_put_batch(remote, &memories[mid..]).await);
            }
            Err(e) => {
                for memory in memories {
                    results.insert(memory.content_hash.clone(), Err(e.clone()));
                }
            }
        }
        results
    })
}

fn handle_failure(
    ctx: &SyncContext,
    entry: &SyncQueueEntry,
    err: &RemoteError,
    stats: &mut CycleStats,
) {
    let attempts = entry.attempt_count + 1;
    match err.class {
        SyncErrorClass::Temporary if attempts < ctx.config.max_attempts => {
            let delay = backoff_delay(
                attempts,
                ctx.config.retry_base_delay(),
                ctx.config.retry_max_delay(),
            );
            let due = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            if let Err(e) = ctx.queue.reschedule(entry.id, attempts, due) {
                tracing::error!("Failed to reschedule entry {}: {}", entry.id, e);
                return;
            }
            stats.rescheduled += 1;
            stats.had_temporary = true;
            tracing::debug!(
                content_hash = %entry.content_hash,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Temporary failure, retrying later: {}",
                err
            );
        }
        SyncErrorClass::Temporary => {
            dead_letter(
                ctx,
                entry,
                attempts,
                &format!("retries exhausted after {} attempts: {}", attempts, err),
                stats,
            );
        }
        SyncErrorClass::Limit | SyncErrorClass::Permanent | SyncErrorClass::Fatal => {
            dead_letter(ctx, entry, attempts, &err.to_string(), stats);
        }
    }
}

fn dead_letter(
    ctx: &SyncContext,
    entry: &SyncQueueEntry,
    attempts: u32,
    reason: &str,
    stats: &mut CycleStats,
) {
    let mut recorded = entry.clone();
    recorded.attempt_count = attempts;
    if let Err(e) = ctx.queue.dead_letter(&recorded, reason) {
        tracing::error!("Failed to dead-letter entry {}: {}", entry.id, e);
        return;
    }
    stats.dead_lettered += 1;
}
