//! Core types for Mnemon

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// Content hash string (`sha256:<hex>`), the cross-store primary key
pub type ContentHash = String;

/// A memory record, addressed by content hash in both stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Deterministic hash of normalized content; unique across both stores
    pub content_hash: ContentHash,
    /// Main content of the memory
    pub content: String,
    /// Memory type (e.g., "note", "todo", "decision"), validated against the
    /// configured taxonomy
    #[serde(rename = "type")]
    pub memory_type: String,
    /// Tags for categorization (case-normalized, deduplicated)
    #[serde(default)]
    pub tags: Vec<String>,
    /// Arbitrary metadata as JSON
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Fixed-length embedding vector, generated by the embedding collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// When the memory was first stored. Immutable after the first successful
    /// store; sync and metadata updates never reset it
    pub created_at: DateTime<Utc>,
    /// When the memory was last mutated
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    /// Build a new memory, computing the content hash and normalizing tags.
    pub fn new(
        content: impl Into<String>,
        memory_type: impl Into<String>,
        tags: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            content_hash: compute_content_hash(&content),
            content,
            memory_type: memory_type.into(),
            tags: normalize_tags(tags),
            metadata,
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = normalize_tags(tags);
        self
    }
}

/// Compute the content hash for deduplication and cross-store identity.
///
/// Normalization: lowercase, collapse whitespace, trim.
pub fn compute_content_hash(content: &str) -> ContentHash {
    let normalized = content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Normalize a tag set: trim, lowercase, drop empties, dedupe preserving
/// first-seen order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags {
        let t = tag.trim().to_lowercase();
        if !t.is_empty() && !seen.contains(&t) {
            seen.push(t);
        }
    }
    seen
}

/// Default memory-type taxonomy
pub const DEFAULT_TAXONOMY: &[&str] = &[
    "note",
    "todo",
    "issue",
    "decision",
    "preference",
    "learning",
    "context",
];

/// Maximum memory-type length
pub const MAX_MEMORY_TYPE_LENGTH: usize = 64;

/// Memory-type validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryTypeError {
    Empty,
    TooLong,
    InvalidChars,
    NotInTaxonomy(String),
}

impl std::fmt::Display for MemoryTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTypeError::Empty => write!(f, "Memory type cannot be empty"),
            MemoryTypeError::TooLong => {
                write!(f, "Memory type exceeds {} characters", MAX_MEMORY_TYPE_LENGTH)
            }
            MemoryTypeError::InvalidChars => write!(
                f,
                "Memory type can only contain lowercase letters, numbers, hyphens, and underscores"
            ),
            MemoryTypeError::NotInTaxonomy(t) => {
                write!(f, "Memory type '{}' is not in the configured taxonomy", t)
            }
        }
    }
}

impl std::error::Error for MemoryTypeError {}

/// Normalize and validate a memory type against a taxonomy.
///
/// An empty taxonomy accepts any well-formed type string (open vocabulary).
pub fn normalize_memory_type(s: &str, taxonomy: &[String]) -> Result<String, MemoryTypeError> {
    let normalized = s.trim().to_lowercase();

    if normalized.is_empty() {
        return Err(MemoryTypeError::Empty);
    }

    if normalized.len() > MAX_MEMORY_TYPE_LENGTH {
        return Err(MemoryTypeError::TooLong);
    }

    if !normalized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(MemoryTypeError::InvalidChars);
    }

    if !taxonomy.is_empty() && !taxonomy.iter().any(|t| t == &normalized) {
        return Err(MemoryTypeError::NotInTaxonomy(normalized));
    }

    Ok(normalized)
}

/// A partial metadata update for an existing memory.
///
/// Only the populated fields are applied; `created_at`, `content` and
/// `embedding` are never touched through this path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialUpdate {
    pub content_hash: ContentHash,
    pub tags: Option<Vec<String>>,
    #[serde(alias = "type")]
    pub memory_type: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// New updated_at; filled with the apply time when None
    pub updated_at: Option<DateTime<Utc>>,
}

impl PartialUpdate {
    pub fn new(content_hash: impl Into<ContentHash>) -> Self {
        Self {
            content_hash: content_hash.into(),
            tags: None,
            memory_type: None,
            metadata: None,
            updated_at: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(normalize_tags(tags));
        self
    }

    pub fn with_memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Apply this update to a record in place. Advances `updated_at` only.
    pub fn apply(&self, memory: &mut Memory) {
        if let Some(tags) = &self.tags {
            memory.tags = tags.clone();
        }
        if let Some(memory_type) = &self.memory_type {
            memory.memory_type = memory_type.clone();
        }
        if let Some(metadata) = &self.metadata {
            memory.metadata = metadata.clone();
        }
        memory.updated_at = self.updated_at.unwrap_or_else(Utc::now);
    }

    /// Fold a later update into this one; later fields win.
    pub fn merge(&mut self, later: &PartialUpdate) {
        if later.tags.is_some() {
            self.tags = later.tags.clone();
        }
        if later.memory_type.is_some() {
            self.memory_type = later.memory_type.clone();
        }
        if later.metadata.is_some() {
            self.metadata = later.metadata.clone();
        }
        if later.updated_at.is_some() {
            self.updated_at = later.updated_at;
        }
    }
}

/// Kind of pending propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Store,
    UpdateMetadata,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Store => "store",
            SyncOperation::UpdateMetadata => "update_metadata",
            SyncOperation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "store" => Ok(SyncOperation::Store),
            "update_metadata" => Ok(SyncOperation::UpdateMetadata),
            "delete" => Ok(SyncOperation::Delete),
            _ => Err(format!("Unknown sync operation: {}", s)),
        }
    }
}

/// Operation-specific payload carried by a queue entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncPayload {
    Store { memory: Memory },
    UpdateMetadata { update: PartialUpdate },
    Delete,
}

impl SyncPayload {
    pub fn operation(&self) -> SyncOperation {
        match self {
            SyncPayload::Store { .. } => SyncOperation::Store,
            SyncPayload::UpdateMetadata { .. } => SyncOperation::UpdateMetadata,
            SyncPayload::Delete => SyncOperation::Delete,
        }
    }
}

/// A pending propagation unit in the durable sync queue
#[derive(Debug, Clone)]
pub struct SyncQueueEntry {
    /// Queue row id
    pub id: i64,
    /// Target record
    pub content_hash: ContentHash,
    /// Operation-specific data
    pub payload: SyncPayload,
    /// When the entry was first enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Incremented on each retry
    pub attempt_count: u32,
    /// Earliest time the entry may be sent again (backoff)
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Bumped on every coalescing merge; an ack only removes the entry when
    /// the drained revision is still current
    pub revision: i64,
}

impl SyncQueueEntry {
    pub fn operation(&self) -> SyncOperation {
        self.payload.operation()
    }
}

/// A sync operation that will never be retried, kept for operator inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub content_hash: ContentHash,
    pub operation: SyncOperation,
    pub payload: Option<serde_json::Value>,
    pub reason: String,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

/// Process-wide sync status. Mutated only by the worker and the controller;
/// callers always receive a snapshot copy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncStatus {
    pub pending_count: i64,
    pub failed_count: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub actively_syncing: bool,
    pub paused: bool,
    pub remote_capacity_used_pct: Option<f32>,
    pub last_error: Option<String>,
}

/// Configuration for the hybrid storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Path to the durable sync-queue database (":memory:" for tests)
    pub queue_path: String,
    /// Whether this process runs the background sync worker. Exactly one
    /// process sharing a local store should own sync
    #[serde(default = "default_true")]
    pub sync_owner: bool,
    /// Seconds between scheduled worker ticks
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Seconds between drift-detection passes
    #[serde(default = "default_drift_interval")]
    pub drift_interval_secs: u64,
    /// Debounce for write-triggered sync nudges, milliseconds
    #[serde(default = "default_nudge_debounce")]
    pub nudge_debounce_ms: u64,
    /// Maximum entries per remote batch call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Base retry delay in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_retry_cap")]
    pub retry_max_delay_ms: u64,
    /// Attempts before an entry is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timestamp difference treated as clock skew, not drift
    #[serde(default = "default_skew_tolerance")]
    pub clock_skew_tolerance_ms: u64,
    /// Run the reconciliation pass when the engine starts
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,
    /// Concurrent remote fetches during reconciliation
    #[serde(default = "default_parallelism")]
    pub reconcile_parallelism: usize,
    /// Hashes examined per drift pass
    #[serde(default = "default_drift_batch")]
    pub drift_batch_size: usize,
    /// Seconds a cached capacity snapshot stays fresh
    #[serde(default = "default_capacity_refresh")]
    pub capacity_refresh_secs: u64,
    /// Capacity percentage that triggers a warning
    #[serde(default = "default_capacity_soft")]
    pub capacity_soft_pct: f32,
    /// Capacity percentage that shrinks batches and pauses background passes
    #[serde(default = "default_capacity_hard")]
    pub capacity_hard_pct: f32,
    /// Maximum accepted content length in bytes (local bound; remote
    /// backends may be stricter and reject via classified errors)
    #[serde(default = "default_max_content")]
    pub max_content_length: usize,
    /// Allowed memory types; empty accepts any well-formed type
    #[serde(default = "default_taxonomy")]
    pub taxonomy: Vec<String>,
    /// Milliseconds granted to the final drain on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    30
}

fn default_drift_interval() -> u64 {
    600
}

fn default_nudge_debounce() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    100
}

fn default_retry_base() -> u64 {
    200
}

fn default_retry_cap() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_skew_tolerance() -> u64 {
    1000
}

fn default_parallelism() -> usize {
    8
}

fn default_drift_batch() -> usize {
    64
}

fn default_capacity_refresh() -> u64 {
    300
}

fn default_capacity_soft() -> f32 {
    80.0
}

fn default_capacity_hard() -> f32 {
    95.0
}

fn default_max_content() -> usize {
    1_048_576
}

fn default_taxonomy() -> Vec<String> {
    DEFAULT_TAXONOMY.iter().map(|s| s.to_string()).collect()
}

fn default_shutdown_grace() -> u64 {
    5000
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            queue_path: ":memory:".to_string(),
            sync_owner: true,
            sync_interval_secs: default_sync_interval(),
            drift_interval_secs: default_drift_interval(),
            nudge_debounce_ms: default_nudge_debounce(),
            batch_size: default_batch_size(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_cap(),
            max_attempts: default_max_attempts(),
            clock_skew_tolerance_ms: default_skew_tolerance(),
            reconcile_on_startup: true,
            reconcile_parallelism: default_parallelism(),
            drift_batch_size: default_drift_batch(),
            capacity_refresh_secs: default_capacity_refresh(),
            capacity_soft_pct: default_capacity_soft(),
            capacity_hard_pct: default_capacity_hard(),
            max_content_length: default_max_content(),
            taxonomy: default_taxonomy(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl HybridConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_secs(self.drift_interval_secs.max(1))
    }

    pub fn nudge_debounce(&self) -> Duration {
        Duration::from_millis(self.nudge_debounce_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn skew_tolerance(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.clock_skew_tolerance_ms as i64)
    }

    pub fn capacity_refresh(&self) -> Duration {
        Duration::from_secs(self.capacity_refresh_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
