//! Integration tests for the aggregation metadata store
//!
//! These run against file-backed SQLite databases so that concurrent callers
//! really go through separate pooled connections.

use aggwarden_metadata::{
    init, LeaseKey, LeaseStore, ManualClock, MetadataError, NewRule, RuleDocument, RuleStore,
    SqliteMetadataStore,
};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TTL: Duration = Duration::from_secs(30);

async fn file_store(dir: &TempDir, clock: ManualClock) -> Arc<SqliteMetadataStore> {
    let path = dir.path().join("metadata.db");
    let store = SqliteMetadataStore::with_clock(path.to_str().unwrap(), Arc::new(clock))
        .await
        .unwrap();
    Arc::new(store)
}

fn rule(rule_id: &str, window: &str) -> NewRule {
    NewRule::new(rule_id, window, "event_count", vec!["event_type".to_string()])
}

// ============================================================================
// Rules
// ============================================================================

#[tokio::test]
async fn test_concurrent_create_same_rule_id() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, ManualClock::new(0)).await;

    let mut handles = Vec::new();
    for window in ["1m", "5m", "10m", "1h"] {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.create(rule("contested", window)).await
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(MetadataError::DuplicateRuleId(id)) => {
                assert_eq!(id, "contested");
                duplicates += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(duplicates, 3);
    assert_eq!(store.list_rules().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_active_rules_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = file_store(&dir, ManualClock::new(0)).await;
        store.create(rule("b_5m", "5m")).await.unwrap();
        store.create(rule("a_1m", "1m")).await.unwrap();
        store.create(rule("c_1h", "1h")).await.unwrap();
        store.set_active("b_5m", false).await.unwrap();
        store.pool().close().await;
    }

    let store = file_store(&dir, ManualClock::new(0)).await;
    let active: Vec<String> = store
        .list_active()
        .map_ok(|rule| rule.rule_id)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(active, vec!["a_1m".to_string(), "c_1h".to_string()]);
}

// ============================================================================
// Leases
// ============================================================================

#[tokio::test]
async fn test_concurrent_acquire_single_winner() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, ManualClock::new(1_000)).await;
    let key = LeaseKey::for_window("rule_1m", 60_000);

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let owner = format!("worker-{}", worker);
            store.acquire_lease(&key, &owner, TTL).await
        }));
    }

    let mut winners = Vec::new();
    let mut reported_holders = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(lease) => winners.push(lease.owner),
            Err(MetadataError::LeaseHeld { owner, .. }) => reported_holders.push(owner),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(reported_holders.len(), 3);
    assert!(reported_holders.iter().all(|owner| owner == &winners[0]));

    let current = store.get_lease(&key).await.unwrap().unwrap();
    assert_eq!(current.owner, winners[0]);
}

#[tokio::test]
async fn test_abandoned_lease_is_reclaimed_after_ttl() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let store = file_store(&dir, clock.clone()).await;
    let key = LeaseKey::for_rule("rule_5m");

    // worker-a crashes without releasing
    store.acquire_lease(&key, "worker-a", TTL).await.unwrap();

    clock.advance(Duration::from_secs(29));
    assert!(store
        .acquire_lease(&key, "worker-b", TTL)
        .await
        .unwrap_err()
        .is_lease_conflict());

    clock.advance(Duration::from_secs(1));
    let lease = store.acquire_lease(&key, "worker-b", TTL).await.unwrap();
    assert_eq!(lease.owner, "worker-b");
    assert_eq!(lease.acquired_at, 31_000);

    // The stale owner can neither renew nor release it
    assert!(matches!(
        store.renew_lease(&key, "worker-a", TTL).await,
        Err(MetadataError::NotOwner { .. })
    ));
    assert!(matches!(
        store.release_lease(&key, "worker-a").await,
        Err(MetadataError::NotOwner { .. })
    ));

    store.release_lease(&key, "worker-b").await.unwrap();
    assert!(store.get_lease(&key).await.unwrap().is_none());
}

// ============================================================================
// Initialization
// ============================================================================

#[tokio::test]
async fn test_initialize_upgrades_legacy_documents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.db");
    let path = path.to_str().unwrap();

    {
        let store = SqliteMetadataStore::new(path).await.unwrap();
        store
            .import_document(RuleDocument {
                id: "old-1".to_string(),
                metric: Some("active_users".to_string()),
                top_n: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .import_document(RuleDocument {
                id: "old-2".to_string(),
                window_size: Some("5m".to_string()),
                metric: Some("event_count".to_string()),
                group_by: Some(vec!["country".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        store.create(rule("current", "1h")).await.unwrap();
        store.pool().close().await;
    }

    let (store, report) = init::initialize(path).await.unwrap();
    assert_eq!(report.identifiers_assigned, 2);
    assert_eq!(report.documents_completed, 1);

    let old_1 = store.get("legacy_old-1").await.unwrap();
    assert_eq!(old_1.window_size, "1m");
    assert_eq!(old_1.metric, "event_count");
    assert_eq!(old_1.group_by, vec!["event_type".to_string()]);
    assert_eq!(old_1.top_n, None);
    assert!(old_1.is_active);

    // Complete apart from its identifier: fields are kept
    let old_2 = store.get("legacy_old-2").await.unwrap();
    assert_eq!(old_2.window_size, "5m");
    assert_eq!(old_2.group_by, vec!["country".to_string()]);
    assert!(old_2.migrated_at.is_some());

    let current = store.get("current").await.unwrap();
    assert!(current.migrated_at.is_none());

    let active: Vec<_> = store.list_active().try_collect().await.unwrap();
    assert_eq!(active.len(), 3);
    store.pool().close().await;

    let (_store, rerun) = init::initialize(path).await.unwrap();
    assert!(rerun.is_noop());
}
