//! Snapshot Storage Integration Tests
//!
//! Run with: cargo test --test storage_test -- --nocapture

mod common;

use chrono::Utc;
use common::Fixture;
use hwlink_discovery::{
    Coin, DiscoveryStatus, PendingTransaction, SnapshotStore, WalletSnapshot,
};
use tempfile::TempDir;

fn setup_store() -> (SnapshotStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = SnapshotStore::new(temp_dir.path().join("wallet"));
    (store, temp_dir)
}

#[test]
fn test_missing_snapshot_is_empty() {
    let (store, _temp) = setup_store();
    let snapshot = store.load().unwrap();
    assert!(snapshot.discovery.is_empty());
    assert!(snapshot.pending.is_empty());
    assert!(snapshot.saved_at.is_none());
}

#[tokio::test]
async fn test_save_and_load_discovery_and_pending() {
    let fx = Fixture::new().await;
    fx.fund(Coin::Ethereum, 0, 10, 1);
    fx.engine.start(&fx.descriptor, Coin::Ethereum).await.unwrap();

    let (store, _temp) = setup_store();
    let pending = PendingTransaction {
        id: "0xaa".into(),
        address: fx.address(Coin::Ethereum, 0),
        nonce: 1,
        amount: 1_000_000_000_000_000_000,
        currency: "ETH".into(),
        rejected: false,
        created_at: Utc::now(),
    };
    store
        .save(&WalletSnapshot {
            discovery: fx.engine.records(),
            pending: vec![pending.clone()],
            saved_at: None,
        })
        .unwrap();

    let loaded = store.load().unwrap();
    assert!(loaded.saved_at.is_some());
    assert_eq!(loaded.discovery, fx.engine.records());
    assert_eq!(loaded.pending, vec![pending]);

    let raw = std::fs::read_to_string(store.base_dir().join("snapshot.json")).unwrap();
    assert!(raw.contains("\"currentIndex\": 1"));
    assert!(raw.contains("\"amount\": \"1000000000000000000\""));
}

#[tokio::test]
async fn test_running_record_loads_as_interrupted() {
    let fx = Fixture::new().await;
    fx.fund_range(Coin::Ethereum, 2);
    fx.engine.start(&fx.descriptor, Coin::Ethereum).await.unwrap();

    let mut records = fx.engine.records();
    records[0].set_status(DiscoveryStatus::Running);

    let (store, _temp) = setup_store();
    store
        .save(&WalletSnapshot {
            discovery: records,
            ..Default::default()
        })
        .unwrap();

    let restored = Fixture::new().await;
    restored.fund_range(Coin::Ethereum, 2);
    restored.engine.load(store.load().unwrap().discovery);

    let record = restored.engine.record(&fx.key(), Coin::Ethereum).unwrap();
    assert_eq!(record.status, DiscoveryStatus::Interrupted);
    assert!(record.interrupted);
    assert_eq!(record.addresses.len(), 3);

    // interrupted records start over from index 0
    restored.device.clear_calls();
    let status = restored
        .engine
        .start(&restored.descriptor, Coin::Ethereum)
        .await
        .unwrap();
    assert_eq!(status, DiscoveryStatus::Completed);
    assert_eq!(restored.device.address_calls(), vec![0, 1, 2]);
}

#[test]
fn test_clear_removes_snapshot() {
    let (store, _temp) = setup_store();
    store.save(&WalletSnapshot::default()).unwrap();
    assert!(store.load().unwrap().saved_at.is_some());

    store.clear().unwrap();
    assert!(store.load().unwrap().saved_at.is_none());
    store.clear().unwrap();
}
