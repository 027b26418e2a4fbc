//! Storage interfaces for the hybrid engine
//!
//! The engine never talks to a concrete backend directly: foreground writes
//! go through [`LocalStore`] and the sync pipeline through [`RemoteStore`].
//! Backends are selected once at startup and passed in as trait objects.

mod sqlite;

#[cfg(feature = "remote-http")]
mod http;

#[cfg(feature = "remote-http")]
pub use http::{HttpRemoteConfig, HttpRemoteStore};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{RemoteError, Result};
use crate::types::{ContentHash, Memory, PartialUpdate};

/// The fast, embedded, low-latency storage backend.
///
/// Methods are synchronous: the backing store is expected to be local disk
/// or memory, and callers on the async side wrap calls where needed. All
/// methods take `&self` so implementations can pool or lock internally.
pub trait LocalStore: Send + Sync {
    /// Insert or replace a record. An existing record's `created_at` is
    /// preserved; everything else is overwritten.
    fn put(&self, memory: &Memory) -> Result<()>;

    /// Fetch a record by content hash.
    fn get(&self, content_hash: &str) -> Result<Option<Memory>>;

    /// Delete a record. Deleting an absent hash is a no-op so replays are
    /// harmless.
    fn delete(&self, content_hash: &str) -> Result<()>;

    /// The full set of known content hashes, in one bulk query.
    fn all_hashes(&self) -> Result<HashSet<ContentHash>>;

    /// `{content_hash, updated_at}` for every record, in one bulk query.
    /// Drift detection and reconciliation compare these against the remote
    /// listing instead of issuing per-record reads.
    fn all_stamps(&self) -> Result<Vec<UpdatedStamp>>;

    /// Apply a batch of metadata updates in a single transaction. Returns
    /// the number of records actually touched; hashes with no local record
    /// are skipped. `created_at`, `content` and `embedding` are never
    /// modified through this path.
    fn update_metadata_batch(&self, updates: &[PartialUpdate]) -> Result<usize>;

    /// Number of stored records.
    fn count(&self) -> Result<i64>;
}

/// Outcome of a batched remote operation: per-hash acks and classified
/// per-hash failures. A batch-level failure (the whole call failed) is the
/// `Err` side of the result instead.
#[derive(Debug, Clone, Default)]
pub struct RemoteBatchOutcome {
    pub acked: Vec<ContentHash>,
    pub errors: HashMap<ContentHash, RemoteError>,
}

impl RemoteBatchOutcome {
    pub fn all_acked(acked: Vec<ContentHash>) -> Self {
        Self {
            acked,
            errors: HashMap::new(),
        }
    }
}

/// A `{content_hash, updated_at}` pair from the remote change listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedStamp {
    pub content_hash: ContentHash,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time remote capacity reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub used_pct: f32,
    pub hard_limit_hit: bool,
}

/// The durable, network-accessed, quota-limited storage backend.
///
/// `put_batch` is an upsert keyed by `content_hash`: re-applying the same
/// record is idempotent, and an existing record's `created_at` is preserved
/// by the remote side. Implementations classify every failure via
/// [`crate::error::classify_status`] or equivalent.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upsert a batch of records.
    async fn put_batch(&self, memories: &[Memory]) -> std::result::Result<RemoteBatchOutcome, RemoteError>;

    /// Fetch a single record.
    async fn get(&self, content_hash: &str) -> std::result::Result<Option<Memory>, RemoteError>;

    /// Delete a batch of records. Absent hashes ack successfully.
    async fn delete_batch(
        &self,
        hashes: &[ContentHash],
    ) -> std::result::Result<RemoteBatchOutcome, RemoteError>;

    /// The full set of known content hashes, in one bulk query.
    async fn all_hashes(&self) -> std::result::Result<HashSet<ContentHash>, RemoteError>;

    /// List `{content_hash, updated_at}` for records updated since the given
    /// instant. Passing the Unix epoch lists every record's stamp.
    async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<UpdatedStamp>, RemoteError>;

    /// Current capacity usage.
    async fn capacity(&self) -> std::result::Result<CapacitySnapshot, RemoteError>;
}
