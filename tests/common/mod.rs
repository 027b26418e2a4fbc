//! Shared test helpers: an in-memory remote store with fault injection and
//! call counters, plus config/record builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mnemon::error::RemoteError;
use mnemon::store::{CapacitySnapshot, RemoteBatchOutcome, RemoteStore, UpdatedStamp};
use mnemon::types::{compute_content_hash, ContentHash, HybridConfig, Memory};

/// In-memory remote store with fault injection.
///
/// Enforces the remote upsert contract: re-applying a record is idempotent
/// and an existing record's `created_at` survives the upsert.
pub struct MockRemoteStore {
    records: Mutex<HashMap<ContentHash, Memory>>,
    reachable: AtomicBool,
    capacity: Mutex<CapacitySnapshot>,
    put_faults: Mutex<HashMap<ContentHash, (u16, String)>>,
    batch_poison: Mutex<Option<(ContentHash, u16, String)>>,
    pub put_batch_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub all_hashes_calls: AtomicUsize,
    pub updated_since_calls: AtomicUsize,
    pub delete_batch_calls: AtomicUsize,
    pub max_put_batch_len: AtomicUsize,
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            capacity: Mutex::new(CapacitySnapshot {
                used_pct: 10.0,
                hard_limit_hit: false,
            }),
            put_faults: Mutex::new(HashMap::new()),
            batch_poison: Mutex::new(None),
            put_batch_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            all_hashes_calls: AtomicUsize::new(0),
            updated_since_calls: AtomicUsize::new(0),
            delete_batch_calls: AtomicUsize::new(0),
            max_put_batch_len: AtomicUsize::new(0),
        }
    }

    pub fn offline(&self) {
        self.reachable.store(false, Ordering::SeqCst);
    }

    pub fn online(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing counters and faults.
    pub fn insert(&self, memory: Memory) {
        self.records
            .lock()
            .insert(memory.content_hash.clone(), memory);
    }

    pub fn record(&self, content_hash: &str) -> Option<Memory> {
        self.records.lock().get(content_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Every future put of this hash fails with the given status code.
    pub fn fail_put_with(&self, content_hash: &str, code: u16, message: &str) {
        self.put_faults
            .lock()
            .insert(content_hash.to_string(), (code, message.to_string()));
    }

    pub fn clear_put_faults(&self) {
        self.put_faults.lock().clear();
    }

    /// Any put batch containing this hash fails wholesale with the given
    /// status, simulating a backend that rejects the entire request.
    pub fn poison_batches_containing(&self, content_hash: &str, code: u16, message: &str) {
        *self.batch_poison.lock() = Some((
            content_hash.to_string(),
            code,
            message.to_string(),
        ));
    }

    pub fn set_capacity(&self, used_pct: f32, hard_limit_hit: bool) {
        *self.capacity.lock() = CapacitySnapshot {
            used_pct,
            hard_limit_hit,
        };
    }

    fn unreachable(&self) -> Option<RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            None
        } else {
            Some(RemoteError::from_status(0, "connection refused"))
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemoteStore {
    async fn put_batch(&self, memories: &[Memory]) -> Result<RemoteBatchOutcome, RemoteError> {
        self.put_batch_calls.fetch_add(1, Ordering::SeqCst);
        self.max_put_batch_len
            .fetch_max(memories.len(), Ordering::SeqCst);
        if let Some(err) = self.unreachable() {
            return Err(err);
        }
        if let Some((hash, code, message)) = self.batch_poison.lock().clone() {
            if memories.iter().any(|m| m.content_hash == hash) {
                return Err(RemoteError::from_status(code, message));
            }
        }

        let faults = self.put_faults.lock().clone();
        let mut records = self.records.lock();
        let mut outcome = RemoteBatchOutcome::default();
        for memory in memories {
            if let Some((code, message)) = faults.get(&memory.content_hash) {
                outcome.errors.insert(
                    memory.content_hash.clone(),
                    RemoteError::from_status(*code, message.clone()),
                );
                continue;
            }
            let mut stored = memory.clone();
            if let Some(existing) = records.get(&memory.content_hash) {
                // Upsert contract: created_at of an existing record survives
                stored.created_at = existing.created_at;
            }
            records.insert(stored.content_hash.clone(), stored);
            outcome.acked.push(memory.content_hash.clone());
        }
        Ok(outcome)
    }

    async fn get(&self, content_hash: &str) -> Result<Option<Memory>, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.unreachable() {
            return Err(err);
        }
        Ok(self.records.lock().get(content_hash).cloned())
    }

    async fn delete_batch(
        &self,
        hashes: &[ContentHash],
    ) -> Result<RemoteBatchOutcome, RemoteError> {
        self.delete_batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.unreachable() {
            return Err(err);
        }
        let mut records = self.records.lock();
        let mut outcome = RemoteBatchOutcome::default();
        for hash in hashes {
            records.remove(hash);
            outcome.acked.push(hash.clone());
        }
        Ok(outcome)
    }

    async fn all_hashes(&self) -> Result<HashSet<ContentHash>, RemoteError> {
        self.all_hashes_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.unreachable() {
            return Err(err);
        }
        Ok(self.records.lock().keys().cloned().collect())
    }

    async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UpdatedStamp>, RemoteError> {
        self.updated_since_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.unreachable() {
            return Err(err);
        }
        Ok(self
            .records
            .lock()
            .values()
            .filter(|m| m.updated_at > since)
            .map(|m| UpdatedStamp {
                content_hash: m.content_hash.clone(),
                updated_at: m.updated_at,
            })
            .collect())
    }

    async fn capacity(&self) -> Result<CapacitySnapshot, RemoteError> {
        if let Some(err) = self.unreachable() {
            return Err(err);
        }
        Ok(*self.capacity.lock())
    }
}

/// Engine config tuned for deterministic tests: no scheduled ticks, no
/// debounced nudges, no startup reconciliation, fast retries. Cycles run
/// only through force_sync_and_wait.
pub fn test_config() -> HybridConfig {
    HybridConfig {
        queue_path: ":memory:".to_string(),
        sync_owner: true,
        sync_interval_secs: 3600,
        drift_interval_secs: 3600,
        nudge_debounce_ms: 3_600_000,
        batch_size: 100,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        max_attempts: 3,
        clock_skew_tolerance_ms: 1000,
        reconcile_on_startup: false,
        reconcile_parallelism: 4,
        drift_batch_size: 64,
        capacity_refresh_secs: 0,
        capacity_soft_pct: 80.0,
        capacity_hard_pct: 95.0,
        max_content_length: 1_048_576,
        taxonomy: vec![],
        shutdown_grace_ms: 2000,
    }
}

/// Build a record with pinned timestamps.
pub fn memory_at(
    content: &str,
    tags: &[&str],
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Memory {
    Memory {
        content_hash: compute_content_hash(content),
        content: content.to_string(),
        memory_type: "note".to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        metadata: HashMap::new(),
        embedding: None,
        created_at,
        updated_at,
    }
}

/// A timestamp `secs` seconds in the past, convenient for ordering.
pub fn secs_ago(secs: i64) -> DateTime<Utc> {
    Utc::now() - Duration::seconds(secs)
}
