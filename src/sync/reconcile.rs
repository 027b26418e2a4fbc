//! Startup reconciliation
//!
//! One-time bulk diff between the two stores. The critical performance
//! property: one `all_hashes` listing per side plus one `updated_since`
//! listing, never per-record existence queries, so startup stays O(1) in
//! round-trips. Remote-only records are pulled with bounded parallelism;
//! local-only records go through the normal queue; records on both sides
//! with diverging timestamps are flagged for the drift detector instead of
//! being re-copied.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;

use super::SyncContext;
use crate::error::Result;
use crate::types::{ContentHash, SyncPayload};

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Remote-only records inserted locally
    pub pulled: usize,
    /// Local-only records enqueued for the remote
    pub pushed: usize,
    /// Both-present records flagged as drift suspects
    pub drift_flagged: usize,
    /// Remote fetches or local inserts that failed (retried next pass)
    pub pull_failures: usize,
    pub elapsed_ms: f64,
}

/// One-shot local/remote diff
pub struct Reconciler {
    ctx: SyncContext,
}

impl Reconciler {
    pub(crate) fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let started = std::time::Instant::now();
        let ctx = &self.ctx;

        let local_hashes = ctx.local.all_hashes()?;
        let remote_hashes = ctx.remote.all_hashes().await?;

        // Pull remote-only records with bounded parallelism
        let remote_only: Vec<ContentHash> =
            remote_hashes.difference(&local_hashes).cloned().collect();
        let mut pulled = 0usize;
        let mut pull_failures = 0usize;

        let parallelism = ctx.config.reconcile_parallelism.max(1);
        let mut fetches = futures::stream::iter(remote_only.into_iter().map(|hash| {
            let remote = ctx.remote.clone();
            async move {
                let result = remote.get(&hash).await;
                (hash, result)
            }
        }))
        .buffer_unordered(parallelism);

        while let Some((hash, result)) = fetches.next().await {
            match result {
                Ok(Some(memory)) => match ctx.local.put(&memory) {
                    Ok(()) => pulled += 1,
                    Err(e) => {
                        tracing::warn!(content_hash = %hash, "Local insert failed: {}", e);
                        pull_failures += 1;
                    }
                },
                // Deleted between the listing and the fetch
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(content_hash = %hash, "Remote fetch failed: {}", e);
                    pull_failures += 1;
                }
            }
        }

        // Push local-only records through the normal queue
        let mut pushed = 0usize;
        for hash in local_hashes.difference(&remote_hashes) {
            if ctx.queue.has_pending(hash)? {
                continue;
            }
            if let Some(memory) = ctx.local.get(hash)? {
                ctx.queue.enqueue(hash, SyncPayload::Store { memory })?;
                pushed += 1;
            }
        }

        // Compare timestamps for records present on both sides, using the
        // bulk remote listing. Diverging hashes are handed to the drift
        // detector; hashes with pending queue entries are left alone
        let remote_stamps: HashMap<ContentHash, DateTime<Utc>> = ctx
            .remote
            .updated_since(DateTime::<Utc>::UNIX_EPOCH)
            .await?
            .into_iter()
            .map(|s| (s.content_hash, s.updated_at))
            .collect();

        let skew = ctx.config.skew_tolerance();
        let mut suspects = Vec::new();
        for stamp in ctx.local.all_stamps()? {
            let Some(remote_at) = remote_stamps.get(&stamp.content_hash) else {
                continue;
            };
            if (*remote_at - stamp.updated_at).abs() <= skew {
                continue;
            }
            if ctx.queue.has_pending(&stamp.content_hash)? {
                continue;
            }
            suspects.push(stamp.content_hash);
        }
        if !suspects.is_empty() {
            ctx.queue.drift_flag(&suspects)?;
        }

        let report = ReconcileReport {
            pulled,
            pushed,
            drift_flagged: suspects.len(),
            pull_failures,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        tracing::info!(
            pulled = report.pulled,
            pushed = report.pushed,
            drift_flagged = report.drift_flagged,
            pull_failures = report.pull_failures,
            "Reconciliation pass finished"
        );
        Ok(report)
    }
}
