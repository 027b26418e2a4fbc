//! Reconciliation and drift-detection scenarios.
//!
//! Run with: cargo test --test drift_reconcile_test

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{memory_at, secs_ago, test_config, MockRemoteStore};
use mnemon::store::{LocalStore, SqliteStore};
use mnemon::sync::DriftSide;
use mnemon::HybridEngine;

fn fixture(remote: Arc<MockRemoteStore>) -> (HybridEngine, Arc<SqliteStore>) {
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = HybridEngine::start(local.clone(), remote, test_config()).unwrap();
    (engine, local)
}

#[tokio::test]
async fn test_reconciliation_symmetric_difference() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    // Local-only record, two remote-only records, one shared record
    let local_only = memory_at("only local", &["a"], secs_ago(500), secs_ago(500));
    local.put(&local_only).unwrap();

    let remote_b = memory_at("only remote b", &["b"], secs_ago(400), secs_ago(400));
    let remote_c = memory_at("only remote c", &["c"], secs_ago(300), secs_ago(300));
    remote.insert(remote_b.clone());
    remote.insert(remote_c.clone());

    let shared = memory_at("on both sides", &["d"], secs_ago(200), secs_ago(200));
    local.put(&shared).unwrap();
    remote.insert(shared.clone());

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.pulled, 2);
    assert_eq!(report.pushed, 1);
    assert_eq!(report.drift_flagged, 0);
    assert_eq!(report.pull_failures, 0);

    // Pulled records keep their original timestamps
    let pulled = local.get(&remote_b.content_hash).unwrap().unwrap();
    assert_eq!(pulled.created_at.to_rfc3339(), remote_b.created_at.to_rfc3339());
    assert_eq!(pulled.updated_at.to_rfc3339(), remote_b.updated_at.to_rfc3339());
    assert!(local.get(&remote_c.content_hash).unwrap().is_some());

    // The local-only record rides the normal queue
    assert_eq!(engine.status().pending_count, 1);
    engine.force_sync_and_wait().await.unwrap();
    assert!(remote.record(&local_only.content_hash).is_some());
}

#[tokio::test]
async fn test_reconciliation_uses_bulk_listings() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    // N remote-only records plus some shared ones
    for i in 0..20 {
        remote.insert(memory_at(
            &format!("remote record {}", i),
            &[],
            secs_ago(100),
            secs_ago(100),
        ));
    }
    for i in 0..5 {
        let shared = memory_at(&format!("shared {}", i), &[], secs_ago(50), secs_ago(50));
        local.put(&shared).unwrap();
        remote.insert(shared);
    }

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.pulled, 20);

    // Existence checks are bulk: one hash listing, one stamp listing.
    // Per-record fetches happen only for the remote-only set
    assert_eq!(remote.all_hashes_calls.load(Ordering::SeqCst), 1);
    assert_eq!(remote.updated_since_calls.load(Ordering::SeqCst), 1);
    assert_eq!(remote.get_calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_reconciliation_flags_drift_instead_of_copying() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    let mut local_side = memory_at("diverged", &["stale"], secs_ago(1000), secs_ago(600));
    let mut remote_side = local_side.clone();
    remote_side.tags = vec!["fresh".to_string()];
    remote_side.updated_at = secs_ago(100);
    local.put(&local_side).unwrap();
    remote.insert(remote_side.clone());

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.pulled, 0);
    assert_eq!(report.pushed, 0);
    assert_eq!(report.drift_flagged, 1);

    // Reconciliation itself copied nothing; the drift pass resolves it
    local_side = local.get(&local_side.content_hash).unwrap().unwrap();
    assert_eq!(local_side.tags, vec!["stale".to_string()]);

    let drift = engine.drift_check(false).await.unwrap();
    assert_eq!(drift.fixes.len(), 1);
    assert_eq!(drift.fixes[0].winner, DriftSide::Remote);

    let fixed = local.get(&local_side.content_hash).unwrap().unwrap();
    assert_eq!(fixed.tags, vec!["fresh".to_string()]);
    assert_eq!(fixed.updated_at.to_rfc3339(), remote_side.updated_at.to_rfc3339());
}

#[tokio::test]
async fn test_drift_remote_newer_wins_metadata_only() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    let mut local_side = memory_at("drifting record", &["local"], secs_ago(1000), secs_ago(200));
    local_side.embedding = Some(vec![1.0, 2.0]);
    local.put(&local_side).unwrap();

    let mut remote_side = local_side.clone();
    remote_side.tags = vec!["remote".to_string()];
    remote_side.memory_type = "decision".to_string();
    remote_side.updated_at = secs_ago(100);
    remote_side.embedding = Some(vec![9.0, 9.0]);
    remote.insert(remote_side.clone());

    let report = engine.drift_check(false).await.unwrap();
    assert_eq!(report.fixes.len(), 1);
    assert_eq!(report.fixes[0].winner, DriftSide::Remote);

    let fixed = local.get(&local_side.content_hash).unwrap().unwrap();
    // Winner's metadata lands
    assert_eq!(fixed.tags, vec!["remote".to_string()]);
    assert_eq!(fixed.memory_type, "decision");
    assert_eq!(fixed.updated_at.to_rfc3339(), remote_side.updated_at.to_rfc3339());
    // Drift never touches created_at, content, or embedding
    assert_eq!(fixed.created_at.to_rfc3339(), local_side.created_at.to_rfc3339());
    assert_eq!(fixed.content, local_side.content);
    assert_eq!(fixed.embedding, Some(vec![1.0, 2.0]));
}

#[tokio::test]
async fn test_drift_local_newer_wins_on_remote() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    let mut local_side = memory_at("local is ahead", &["local"], secs_ago(1000), secs_ago(50));
    local.put(&local_side).unwrap();

    let mut remote_side = local_side.clone();
    remote_side.tags = vec!["old".to_string()];
    remote_side.updated_at = secs_ago(500);
    remote_side.created_at = secs_ago(2000);
    remote_side.embedding = Some(vec![7.0]);
    remote.insert(remote_side.clone());

    let report = engine.drift_check(false).await.unwrap();
    assert_eq!(report.fixes.len(), 1);
    assert_eq!(report.fixes[0].winner, DriftSide::Local);

    let fixed = remote.record(&local_side.content_hash).unwrap();
    assert_eq!(fixed.tags, vec!["local".to_string()]);
    assert_eq!(fixed.updated_at.to_rfc3339(), local_side.updated_at.to_rfc3339());
    // The remote record's own created_at and embedding survive
    assert_eq!(fixed.created_at.to_rfc3339(), remote_side.created_at.to_rfc3339());
    assert_eq!(fixed.embedding, Some(vec![7.0]));

    // The local side is untouched
    local_side = local.get(&local_side.content_hash).unwrap().unwrap();
    assert_eq!(local_side.tags, vec!["local".to_string()]);
}

#[tokio::test]
async fn test_timestamps_within_skew_are_not_drift() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    let base = secs_ago(300);
    let skewed = memory_at("close enough", &["a"], secs_ago(1000), base);
    local.put(&skewed).unwrap();
    let mut remote_skewed = skewed.clone();
    remote_skewed.tags = vec!["b".to_string()];
    // Half a second apart: inside the 1s tolerance, treated as clock skew
    remote_skewed.updated_at = base + chrono::Duration::milliseconds(500);
    remote.insert(remote_skewed);

    // Exactly equal timestamps: no side is strictly newer, also a no-op
    let tied = memory_at("exactly tied", &["x"], secs_ago(1000), base);
    local.put(&tied).unwrap();
    let mut remote_tied = tied.clone();
    remote_tied.tags = vec!["y".to_string()];
    remote.insert(remote_tied);

    let report = engine.drift_check(false).await.unwrap();
    assert!(report.fixes.is_empty());
    assert_eq!(report.checked, 2);

    let unchanged = local.get(&skewed.content_hash).unwrap().unwrap();
    assert_eq!(unchanged.tags, vec!["a".to_string()]);
    let unchanged = local.get(&tied.content_hash).unwrap().unwrap();
    assert_eq!(unchanged.tags, vec!["x".to_string()]);
}

#[tokio::test]
async fn test_pending_queue_entry_defers_drift() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    // Foreground write queues an entry for this hash
    remote.offline();
    let stored = engine
        .put(mnemon::Memory::new(
            "queued and drifting",
            "note",
            vec!["queued".to_string()],
            Default::default(),
        ))
        .unwrap();

    // The remote side looks newer, but the queue wins
    remote.online();
    let mut remote_side = stored.clone();
    remote_side.tags = vec!["remote".to_string()];
    remote_side.updated_at = stored.updated_at + chrono::Duration::seconds(300);
    remote.insert(remote_side);

    let report = engine.drift_check(false).await.unwrap();
    assert_eq!(report.skipped_pending, 1);
    assert!(report.fixes.is_empty());

    let untouched = local.get(&stored.content_hash).unwrap().unwrap();
    assert_eq!(untouched.tags, vec!["queued".to_string()]);
}

#[tokio::test]
async fn test_drift_dry_run_reports_without_applying() {
    let remote = Arc::new(MockRemoteStore::new());
    let (engine, local) = fixture(remote.clone());

    let local_side = memory_at("verify first", &["local"], secs_ago(1000), secs_ago(400));
    local.put(&local_side).unwrap();

    let mut remote_side = local_side.clone();
    remote_side.tags = vec!["remote".to_string()];
    remote_side.updated_at = secs_ago(100);
    remote.insert(remote_side);

    let report = engine.drift_check(true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.fixes.len(), 1);
    assert_eq!(report.fixes[0].winner, DriftSide::Remote);

    // Nothing was written on either side
    let untouched = local.get(&local_side.content_hash).unwrap().unwrap();
    assert_eq!(untouched.tags, vec!["local".to_string()]);
    assert_eq!(
        remote.record(&local_side.content_hash).unwrap().tags,
        vec!["remote".to_string()]
    );

    // Bookkeeping untouched too: a second dry run sees the same drift
    let again = engine.drift_check(true).await.unwrap();
    assert_eq!(again.fixes.len(), 1);
}
