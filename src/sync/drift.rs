//! Metadata drift detection and resolution
//!
//! Drift is divergence between the two stores for the same record that did
//! not come through the sync queue (e.g., an edit made directly against the
//! remote). A bounded batch of hashes is examined per pass, oldest-checked
//! first so every record is eventually covered; reconciliation can flag
//! suspects for priority checking.
//!
//! Resolution: the side with the strictly newer `updated_at` wins, and only
//! its metadata (tags, memory_type, metadata map, updated_at) overwrites the
//! other side. `created_at`, `content` and `embedding` are never changed by
//! drift; only explicit store operations replace those. A hash with a
//! pending queue entry is skipped entirely (the queue wins).

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::SyncContext;
use crate::error::{Result, SyncErrorClass};
use crate::types::{ContentHash, Memory, PartialUpdate};

/// Which store supplied the winning metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSide {
    Local,
    Remote,
}

/// One resolved (or, in dry-run, intended) drift fix
#[derive(Debug, Clone, Serialize)]
pub struct DriftFix {
    pub content_hash: ContentHash,
    pub winner: DriftSide,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
}

/// Outcome of one drift pass
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Hashes examined this pass
    pub checked: usize,
    /// Hashes skipped because the queue holds a pending entry for them
    pub skipped_pending: usize,
    /// Fixes applied (or intended, when dry_run)
    pub fixes: Vec<DriftFix>,
    /// True when nothing was written on either side
    pub dry_run: bool,
}

/// Periodic metadata drift scanner
pub struct DriftDetector {
    ctx: SyncContext,
}

impl DriftDetector {
    pub(crate) fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Examine one batch of candidates. With `dry_run` the report lists the
    /// intended changes and neither store nor the bookkeeping is touched.
    pub async fn run_batch(&self, dry_run: bool) -> Result<DriftReport> {
        let ctx = &self.ctx;
        let skew = ctx.config.skew_tolerance();

        let local_stamps = ctx.local.all_stamps()?;
        let bookkeeping = ctx.queue.drift_bookkeeping()?;

        // Flagged suspects first, then never-checked, then oldest-checked
        let mut candidates: Vec<(ContentHash, DateTime<Utc>)> = local_stamps
            .into_iter()
            .map(|s| (s.content_hash, s.updated_at))
            .collect();
        candidates.sort_by_key(|(hash, _)| {
            let (last_checked, flagged) = bookkeeping.get(hash).copied().unwrap_or((None, false));
            (!flagged, last_checked.is_some(), last_checked)
        });
        candidates.truncate(ctx.config.drift_batch_size.max(1));

        let mut checked: Vec<ContentHash> = Vec::new();
        let mut skipped_pending = 0usize;
        let mut fixes: Vec<DriftFix> = Vec::new();
        let mut local_updates: Vec<PartialUpdate> = Vec::new();
        let mut remote_pushes: Vec<Memory> = Vec::new();

        for (hash, local_at) in candidates {
            if ctx.queue.has_pending(&hash)? {
                skipped_pending += 1;
                continue;
            }

            let remote_memory = match ctx.remote.get(&hash).await {
                Ok(memory) => memory,
                Err(e) if e.class == SyncErrorClass::Temporary => {
                    tracing::warn!("Drift pass aborted, remote unavailable: {}", e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(content_hash = %hash, "Drift check failed: {}", e);
                    checked.push(hash);
                    continue;
                }
            };

            // Missing remotely is reconciliation's problem, not drift's
            let Some(remote_memory) = remote_memory else {
                checked.push(hash);
                continue;
            };

            let delta = remote_memory.updated_at - local_at;
            if delta.abs() <= skew {
                // Within clock-skew tolerance (including exact ties): no-op
                checked.push(hash);
                continue;
            }

            if remote_memory.updated_at > local_at {
                fixes.push(DriftFix {
                    content_hash: hash.clone(),
                    winner: DriftSide::Remote,
                    local_updated_at: local_at,
                    remote_updated_at: remote_memory.updated_at,
                });
                local_updates.push(PartialUpdate {
                    content_hash: hash.clone(),
                    tags: Some(remote_memory.tags),
                    memory_type: Some(remote_memory.memory_type),
                    metadata: Some(remote_memory.metadata),
                    updated_at: Some(remote_memory.updated_at),
                });
            } else {
                let Some(local_memory) = ctx.local.get(&hash)? else {
                    checked.push(hash);
                    continue;
                };
                fixes.push(DriftFix {
                    content_hash: hash.clone(),
                    winner: DriftSide::Local,
                    local_updated_at: local_at,
                    remote_updated_at: remote_memory.updated_at,
                });
                // Graft the winning metadata onto the remote's own record so
                // its created_at, content and embedding survive the upsert
                let mut merged = remote_memory;
                merged.tags = local_memory.tags;
                merged.memory_type = local_memory.memory_type;
                merged.metadata = local_memory.metadata;
                merged.updated_at = local_memory.updated_at;
                remote_pushes.push(merged);
            }
            checked.push(hash);
        }

        if !dry_run {
            if !local_updates.is_empty() {
                ctx.local.update_metadata_batch(&local_updates)?;
            }
            if !remote_pushes.is_empty() {
                match ctx.remote.put_batch(&remote_pushes).await {
                    Ok(outcome) => {
                        for (hash, err) in outcome.errors {
                            tracing::warn!(content_hash = %hash, "Drift push rejected: {}", err);
                        }
                    }
                    Err(e) => tracing::warn!("Drift push failed: {}", e),
                }
            }
            ctx.queue.drift_touch(&checked, Utc::now())?;
        }

        Ok(DriftReport {
            checked: checked.len(),
            skipped_pending,
            fixes,
            dry_run,
        })
    }
}
