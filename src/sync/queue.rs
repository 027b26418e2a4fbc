//! Durable sync queue
//!
//! Pending remote operations persisted in their own SQLite database so they
//! survive restarts. At most one live entry exists per content hash: later
//! operations for the same hash are coalesced into the pending entry instead
//! of appended behind it, which keeps per-hash ordering trivial and avoids
//! redundant remote round-trips.
//!
//! Entries carry a `revision` counter bumped on every coalescing merge. The
//! worker acks with the revision it drained; if a merge landed while the
//! batch was in flight the ack misses and the merged entry is re-sent, which
//! is safe because remote upserts are idempotent.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{DeadLetter, SyncOperation, SyncPayload, SyncQueueEntry};

/// Durable FIFO of operations awaiting propagation to the remote store
pub struct SyncQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SyncQueue {
    /// Open or create the queue database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = if path.to_str() == Some(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(path, flags)?
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            "#,
        )?;

        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory queue (testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Append or coalesce a pending operation.
    ///
    /// Non-blocking with respect to the remote store; it only fails when the
    /// queue database itself cannot accept the write, which the caller must
    /// treat as fatal.
    pub fn enqueue(&self, content_hash: &str, payload: SyncPayload) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT id, operation, payload FROM sync_queue WHERE content_hash = ?1",
                params![content_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            None => {
                let operation = payload.operation();
                tx.execute(
                    "INSERT INTO sync_queue (content_hash, operation, payload, enqueued_at, attempt_count, next_attempt_at, revision)
                     VALUES (?1, ?2, ?3, ?4, 0, NULL, 0)",
                    params![
                        content_hash,
                        operation.as_str(),
                        serde_json::to_string(&payload)?,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
            }
            Some((id, existing_op, existing_payload)) => {
                let merged = coalesce(&existing_op, &existing_payload, payload)?;
                match merged {
                    Some(merged) => {
                        let operation = merged.operation();
                        // A merge changes the payload, so the entry gets a
                        // fresh retry budget and is due immediately
                        tx.execute(
                            "UPDATE sync_queue SET operation = ?1, payload = ?2,
                                attempt_count = 0, next_attempt_at = NULL,
                                revision = revision + 1
                             WHERE id = ?3",
                            params![operation.as_str(), serde_json::to_string(&merged)?, id],
                        )?;
                    }
                    None => {
                        tracing::warn!(
                            content_hash,
                            "Ignoring metadata update queued behind a pending delete"
                        );
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Return up to `max` entries due at `now`, oldest first, without
    /// removing them. Removal happens only through [`ack`] or
    /// [`dead_letter`].
    ///
    /// [`ack`]: SyncQueue::ack
    /// [`dead_letter`]: SyncQueue::dead_letter
    pub fn drain(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<SyncQueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, content_hash, payload, enqueued_at, attempt_count, next_attempt_at, revision
             FROM sync_queue
             WHERE next_attempt_at IS NULL OR next_attempt_at <= ?1
             ORDER BY id
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![now.to_rfc3339(), max as i64], |row| {
                let id: i64 = row.get(0)?;
                let content_hash: String = row.get(1)?;
                let payload: String = row.get(2)?;
                let enqueued_at: String = row.get(3)?;
                let attempt_count: u32 = row.get(4)?;
                let next_attempt_at: Option<String> = row.get(5)?;
                let revision: i64 = row.get(6)?;
                Ok((
                    id,
                    content_hash,
                    payload,
                    enqueued_at,
                    attempt_count,
                    next_attempt_at,
                    revision,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, content_hash, payload, enqueued_at, attempt_count, next_attempt_at, revision) in
            rows
        {
            entries.push(SyncQueueEntry {
                id,
                content_hash,
                payload: serde_json::from_str(&payload)?,
                enqueued_at: parse_ts(&enqueued_at),
                attempt_count,
                next_attempt_at: next_attempt_at.as_deref().map(parse_ts),
                revision,
            });
        }
        Ok(entries)
    }

    /// Remove a confirmed entry. Returns false when the entry was merged
    /// while in flight (revision moved on) and therefore stays queued.
    pub fn ack(&self, id: i64, revision: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sync_queue WHERE id = ?1 AND revision = ?2",
            params![id, revision],
        )?;
        Ok(removed > 0)
    }

    /// Record a failed attempt and schedule the next one.
    pub fn reschedule(
        &self,
        id: i64,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sync_queue SET attempt_count = ?1, next_attempt_at = ?2 WHERE id = ?3",
            params![attempt_count, next_attempt_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Move an entry to the dead-letter table. Skipped when the entry was
    /// merged while in flight; the merged payload deserves its own attempts.
    pub fn dead_letter(&self, entry: &SyncQueueEntry, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM sync_queue WHERE id = ?1 AND revision = ?2",
            params![entry.id, entry.revision],
        )?;
        if removed > 0 {
            tx.execute(
                "INSERT INTO dead_letters (content_hash, operation, payload, reason, attempt_count, enqueued_at, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.content_hash,
                    entry.operation().as_str(),
                    serde_json::to_string(&entry.payload)?,
                    reason,
                    entry.attempt_count,
                    entry.enqueued_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tracing::warn!(
                content_hash = %entry.content_hash,
                operation = entry.operation().as_str(),
                reason,
                "Sync entry dead-lettered"
            );
        }

        tx.commit()?;
        Ok(())
    }

    /// Number of entries awaiting propagation.
    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Whether a hash has a pending entry. Drift resolution defers to the
    /// queue when this is true.
    pub fn has_pending(&self, content_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE content_hash = ?1",
            params![content_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of dead-lettered operations.
    pub fn dead_letter_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent dead letters for operator inspection.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, content_hash, operation, payload, reason, attempt_count, enqueued_at, failed_at
             FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let content_hash: String = row.get(1)?;
                let operation: String = row.get(2)?;
                let payload: Option<String> = row.get(3)?;
                let reason: String = row.get(4)?;
                let attempt_count: u32 = row.get(5)?;
                let enqueued_at: String = row.get(6)?;
                let failed_at: String = row.get(7)?;
                Ok((
                    id,
                    content_hash,
                    operation,
                    payload,
                    reason,
                    attempt_count,
                    enqueued_at,
                    failed_at,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut letters = Vec::with_capacity(rows.len());
        for (id, content_hash, operation, payload, reason, attempt_count, enqueued_at, failed_at) in
            rows
        {
            letters.push(DeadLetter {
                id,
                content_hash,
                operation: operation
                    .parse::<SyncOperation>()
                    .unwrap_or(SyncOperation::Store),
                payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                reason,
                attempt_count,
                enqueued_at: parse_ts(&enqueued_at),
                failed_at: parse_ts(&failed_at),
            });
        }
        Ok(letters)
    }

    // ------------------------------------------------------------------
    // Drift bookkeeping
    //
    // The queue database also tracks when each hash was last examined for
    // drift, so the detector can scan oldest-first and reconciliation can
    // flag suspects for priority checking.
    // ------------------------------------------------------------------

    /// Mark hashes as drift suspects (checked first on the next pass).
    pub fn drift_flag(&self, hashes: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for hash in hashes {
            tx.execute(
                "INSERT INTO drift_checks (content_hash, last_checked_at, flagged)
                 VALUES (?1, NULL, 1)
                 ON CONFLICT(content_hash) DO UPDATE SET flagged = 1",
                params![hash],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a completed drift examination and clear any flag.
    pub fn drift_touch(&self, hashes: &[String], at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for hash in hashes {
            tx.execute(
                "INSERT INTO drift_checks (content_hash, last_checked_at, flagged)
                 VALUES (?1, ?2, 0)
                 ON CONFLICT(content_hash) DO UPDATE SET last_checked_at = ?2, flagged = 0",
                params![hash, at.to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Bookkeeping per hash: (last_checked_at, flagged).
    pub fn drift_bookkeeping(
        &self,
    ) -> Result<std::collections::HashMap<String, (Option<DateTime<Utc>>, bool)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT content_hash, last_checked_at, flagged FROM drift_checks")?;
        let rows = stmt
            .query_map([], |row| {
                let hash: String = row.get(0)?;
                let last: Option<String> = row.get(1)?;
                let flagged: i64 = row.get(2)?;
                Ok((hash, last, flagged != 0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(hash, last, flagged)| (hash, (last.as_deref().map(parse_ts), flagged)))
            .collect())
    }
}

impl Clone for SyncQueue {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL UNIQUE,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                revision INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_sync_queue_due ON sync_queue(next_attempt_at);
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT,
                reason TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS drift_checks (
                content_hash TEXT PRIMARY KEY,
                last_checked_at TEXT,
                flagged INTEGER NOT NULL DEFAULT 0
            );
            PRAGMA user_version = 1;
            "#,
        )?;
    }
    Ok(())
}

/// Fold a later operation into the pending one for the same hash.
///
/// Returns None when the incoming operation should be dropped (metadata
/// update behind a pending delete).
fn coalesce(
    existing_op: &str,
    existing_payload: &str,
    incoming: SyncPayload,
) -> Result<Option<SyncPayload>> {
    let merged = match incoming {
        // A full store or a delete supersedes whatever was pending
        SyncPayload::Store { memory } => Some(SyncPayload::Store { memory }),
        SyncPayload::Delete => Some(SyncPayload::Delete),
        SyncPayload::UpdateMetadata { update } => match existing_op
            .parse::<SyncOperation>()
            .map_err(crate::error::MnemonError::Sync)?
        {
            SyncOperation::Store => {
                let mut existing: SyncPayload = serde_json::from_str(existing_payload)?;
                if let SyncPayload::Store { memory } = &mut existing {
                    update.apply(memory);
                }
                Some(existing)
            }
            SyncOperation::UpdateMetadata => {
                let mut existing: SyncPayload = serde_json::from_str(existing_payload)?;
                if let SyncPayload::UpdateMetadata { update: pending } = &mut existing {
                    pending.merge(&update);
                }
                Some(existing)
            }
            SyncOperation::Delete => None,
        },
    };
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Memory, PartialUpdate};
    use std::collections::HashMap;

    fn mem(content: &str) -> Memory {
        Memory::new(content, "note", vec![], HashMap::new())
    }

    fn store_payload(memory: &Memory) -> SyncPayload {
        SyncPayload::Store {
            memory: memory.clone(),
        }
    }

    #[test]
    fn test_enqueue_drain_ack() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let memory = mem("first");
        queue
            .enqueue(&memory.content_hash, store_payload(&memory))
            .unwrap();
        assert_eq!(queue.pending_count().unwrap(), 1);

        let entries = queue.drain(10, Utc::now()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content_hash, memory.content_hash);
        assert_eq!(entries[0].attempt_count, 0);

        // Drain does not remove
        assert_eq!(queue.pending_count().unwrap(), 1);

        assert!(queue.ack(entries[0].id, entries[0].revision).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_update_coalesces_into_pending_store() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let memory = mem("coalesce me");
        queue
            .enqueue(&memory.content_hash, store_payload(&memory))
            .unwrap();

        let update = PartialUpdate::new(memory.content_hash.clone())
            .with_tags(vec!["merged".to_string()]);
        queue
            .enqueue(
                &memory.content_hash,
                SyncPayload::UpdateMetadata { update },
            )
            .unwrap();

        // Still a single entry, now carrying the merged tags
        assert_eq!(queue.pending_count().unwrap(), 1);
        let entries = queue.drain(10, Utc::now()).unwrap();
        match &entries[0].payload {
            SyncPayload::Store { memory } => {
                assert_eq!(memory.tags, vec!["merged".to_string()]);
            }
            other => panic!("expected Store payload, got {:?}", other),
        }
        assert_eq!(entries[0].revision, 1);
    }

    #[test]
    fn test_updates_merge_together() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let hash = "sha256:u".to_string();
        queue
            .enqueue(
                &hash,
                SyncPayload::UpdateMetadata {
                    update: PartialUpdate::new(hash.clone()).with_tags(vec!["a".to_string()]),
                },
            )
            .unwrap();
        queue
            .enqueue(
                &hash,
                SyncPayload::UpdateMetadata {
                    update: PartialUpdate::new(hash.clone()).with_memory_type("decision"),
                },
            )
            .unwrap();

        let entries = queue.drain(10, Utc::now()).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].payload {
            SyncPayload::UpdateMetadata { update } => {
                assert_eq!(update.tags, Some(vec!["a".to_string()]));
                assert_eq!(update.memory_type, Some("decision".to_string()));
            }
            other => panic!("expected UpdateMetadata payload, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_supersedes_pending_store() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let memory = mem("doomed");
        queue
            .enqueue(&memory.content_hash, store_payload(&memory))
            .unwrap();
        queue
            .enqueue(&memory.content_hash, SyncPayload::Delete)
            .unwrap();

        let entries = queue.drain(10, Utc::now()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].payload, SyncPayload::Delete));
    }

    #[test]
    fn test_update_behind_delete_is_dropped() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let hash = "sha256:gone".to_string();
        queue.enqueue(&hash, SyncPayload::Delete).unwrap();
        queue
            .enqueue(
                &hash,
                SyncPayload::UpdateMetadata {
                    update: PartialUpdate::new(hash.clone()),
                },
            )
            .unwrap();

        let entries = queue.drain(10, Utc::now()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].payload, SyncPayload::Delete));
    }

    #[test]
    fn test_in_flight_merge_defeats_ack() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let memory = mem("in flight");
        queue
            .enqueue(&memory.content_hash, store_payload(&memory))
            .unwrap();

        let drained = queue.drain(10, Utc::now()).unwrap();
        let entry = &drained[0];

        // A merge lands while the entry is in flight
        queue
            .enqueue(
                &memory.content_hash,
                SyncPayload::UpdateMetadata {
                    update: PartialUpdate::new(memory.content_hash.clone())
                        .with_tags(vec!["late".to_string()]),
                },
            )
            .unwrap();

        // The stale-revision ack must not remove the merged entry
        assert!(!queue.ack(entry.id, entry.revision).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_reschedule_hides_until_due() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let memory = mem("backing off");
        queue
            .enqueue(&memory.content_hash, store_payload(&memory))
            .unwrap();

        let entry = &queue.drain(10, Utc::now()).unwrap()[0];
        let later = Utc::now() + chrono::Duration::seconds(60);
        queue.reschedule(entry.id, 1, later).unwrap();

        assert!(queue.drain(10, Utc::now()).unwrap().is_empty());
        let due = queue
            .drain(10, Utc::now() + chrono::Duration::seconds(120))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt_count, 1);
    }

    #[test]
    fn test_dead_letter_moves_entry() {
        let queue = SyncQueue::open_in_memory().unwrap();
        let memory = mem("poison");
        queue
            .enqueue(&memory.content_hash, store_payload(&memory))
            .unwrap();

        let entry = queue.drain(10, Utc::now()).unwrap().remove(0);
        queue.dead_letter(&entry, "limit error: too large").unwrap();

        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(queue.dead_letter_count().unwrap(), 1);
        let letters = queue.dead_letters(10).unwrap();
        assert_eq!(letters[0].content_hash, memory.content_hash);
        assert_eq!(letters[0].reason, "limit error: too large");
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let memory = mem("durable");
        {
            let queue = SyncQueue::open(&path).unwrap();
            queue
                .enqueue(&memory.content_hash, store_payload(&memory))
                .unwrap();
            let entry = &queue.drain(10, Utc::now()).unwrap()[0];
            queue
                .reschedule(entry.id, 2, Utc::now() - chrono::Duration::seconds(1))
                .unwrap();
        }

        let queue = SyncQueue::open(&path).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 1);
        let entries = queue.drain(10, Utc::now()).unwrap();
        assert_eq!(entries[0].attempt_count, 2);
        assert_eq!(entries[0].content_hash, memory.content_hash);
    }

    #[test]
    fn test_drift_bookkeeping_roundtrip() {
        let queue = SyncQueue::open_in_memory().unwrap();
        queue
            .drift_flag(&["sha256:a".to_string(), "sha256:b".to_string()])
            .unwrap();
        let now = Utc::now();
        queue.drift_touch(&["sha256:a".to_string()], now).unwrap();

        let book = queue.drift_bookkeeping().unwrap();
        let (checked_a, flagged_a) = &book["sha256:a"];
        assert!(checked_a.is_some());
        assert!(!flagged_a);
        let (checked_b, flagged_b) = &book["sha256:b"];
        assert!(checked_b.is_none());
        assert!(*flagged_b);
    }
}
