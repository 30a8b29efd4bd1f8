//! Pending Reconciler Integration Tests
//!
//! Optimistic transaction tracking against confirmed backend state, both
//! with hand-built account snapshots and through block-driven sync.
//!
//! Run with: cargo test --test pending_test -- --nocapture

mod common;

use chrono::Utc;
use common::{eventually, init_logger, Fixture};
use hwlink_discovery::{
    AccountInfo, BlockSync, Coin, LinkError, PendingReconciler, PendingTransaction,
    SubscribeRequest, TransactionDraft,
};
use std::sync::Arc;
use tokio::sync::Mutex;

const ADDRESS: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";

fn pending(id: &str, nonce: u64, amount: u128) -> PendingTransaction {
    PendingTransaction {
        id: id.to_string(),
        address: ADDRESS.to_string(),
        nonce,
        amount,
        currency: "ETH".to_string(),
        rejected: false,
        created_at: Utc::now(),
    }
}

fn account(balance: u128, transaction_count: u64) -> AccountInfo {
    AccountInfo {
        address: ADDRESS.to_string(),
        balance: balance.to_string(),
        transaction_count,
        block_height: 100,
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

#[test]
fn test_used_nonce_resolves_pending() {
    init_logger();
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    reconciler.add(pending("0xaa", 5, 300));

    let resolved = reconciler.observe(&account(1_000, 6));

    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, "0xaa");
    assert!(reconciler.records().is_empty());
    assert_eq!(reconciler.available_balance(ADDRESS), Some(1_000));
}

#[test]
fn test_unused_nonce_stays_pending() {
    init_logger();
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    reconciler.add(pending("0xaa", 5, 300));

    let resolved = reconciler.observe(&account(1_000, 5));

    assert!(resolved.is_empty());
    assert_eq!(reconciler.records().len(), 1);
    assert_eq!(reconciler.pending_amount(ADDRESS), 300);
    assert_eq!(reconciler.available_balance(ADDRESS), Some(700));
    assert_eq!(reconciler.pending_nonce(ADDRESS), Some(6));
}

#[test]
fn test_rejected_transactions_do_not_count() {
    init_logger();
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    reconciler.add(pending("0xaa", 5, 300));
    reconciler.add(pending("0xbb", 6, 200));
    assert!(reconciler.reject("0xbb"));
    assert!(!reconciler.reject("0xcc"));

    reconciler.observe(&account(1_000, 5));
    assert_eq!(reconciler.available_balance(ADDRESS), Some(700));

    // kept for display even once its nonce is used
    reconciler.observe(&account(700, 7));
    let remaining = reconciler.records();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "0xbb");
    assert!(remaining[0].rejected);
    assert_eq!(reconciler.available_balance(ADDRESS), Some(700));
}

#[test]
fn test_other_currency_is_ignored() {
    init_logger();
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    reconciler.add(PendingTransaction {
        currency: "ETC".into(),
        ..pending("0xaa", 1, 500)
    });

    reconciler.observe(&account(1_000, 0));
    assert_eq!(reconciler.pending_amount(ADDRESS), 0);
    assert_eq!(reconciler.available_balance(ADDRESS), Some(1_000));
}

#[test]
fn test_addresses_are_case_insensitive() {
    init_logger();
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    reconciler.add(pending("0xaa", 0, 10));

    let resolved = reconciler.observe(&AccountInfo {
        address: ADDRESS.to_lowercase(),
        ..account(90, 1)
    });
    assert_eq!(resolved.len(), 1);
    assert_eq!(reconciler.available_balance(&ADDRESS.to_uppercase()), Some(90));
}

#[test]
fn test_unknown_balance_is_none() {
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    reconciler.add(pending("0xaa", 0, 10));
    assert_eq!(reconciler.available_balance(ADDRESS), None);
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn test_broadcast_tracks_txid() {
    let fx = Fixture::new().await;
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);

    let txid = reconciler
        .broadcast(
            fx.channel.as_ref(),
            TransactionDraft {
                address: ADDRESS.into(),
                nonce: 0,
                amount: 25,
                hex: "0xf86b80".into(),
            },
        )
        .await
        .unwrap();

    let records = reconciler.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, txid);
    assert_eq!(records[0].currency, "ETH");
    assert!(!records[0].rejected);
    assert_eq!(fx.backend.pushed_transactions(), vec!["0xf86b80".to_string()]);
}

#[tokio::test]
async fn test_failed_broadcast_is_marked_rejected() {
    let fx = Fixture::new().await;
    fx.backend.fail_next_push("insufficient funds");
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);

    let err = reconciler
        .broadcast(
            fx.channel.as_ref(),
            TransactionDraft {
                address: ADDRESS.into(),
                nonce: 0,
                amount: 25,
                hex: "0xf86b80".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Backend(_)));

    let records = reconciler.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].rejected);
    assert_eq!(reconciler.pending_amount(ADDRESS), 0);
    assert_eq!(reconciler.pending_nonce(ADDRESS), None);
}

#[tokio::test]
async fn test_retry_with_same_nonce_keeps_rejected_record() {
    let fx = Fixture::new().await;
    fx.backend.fail_next_push("underpriced");
    let mut reconciler = PendingReconciler::new(Coin::Ethereum);
    let draft = TransactionDraft {
        address: ADDRESS.into(),
        nonce: 5,
        amount: 40,
        hex: "0xf86b05".into(),
    };

    assert!(reconciler.broadcast(fx.channel.as_ref(), draft.clone()).await.is_err());
    let txid = reconciler.broadcast(fx.channel.as_ref(), draft).await.unwrap();

    let records = reconciler.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().filter(|p| p.rejected).count(), 1);
    assert!(records.iter().any(|p| p.id == txid && !p.rejected));
    assert_eq!(reconciler.pending_amount(ADDRESS), 40);
    assert_eq!(reconciler.pending_nonce(ADDRESS), Some(6));
}

// ============================================================================
// Block sync
// ============================================================================

#[tokio::test]
async fn test_block_resolves_confirmed_transaction() {
    let fx = Fixture::new().await;
    fx.fund(Coin::Ethereum, 0, 1_000, 1);
    fx.engine.start(&fx.descriptor, Coin::Ethereum).await.unwrap();

    let address = fx.address(Coin::Ethereum, 0);
    let reconciler = Arc::new(Mutex::new(PendingReconciler::new(Coin::Ethereum)));
    reconciler.lock().await.add(PendingTransaction {
        address: address.clone(),
        ..pending("0xaa", 1, 300)
    });

    let sync = BlockSync::new(fx.engine.clone(), Coin::Ethereum, reconciler.clone());

    let resolved = sync.on_block(1).await.unwrap();
    assert!(resolved.is_empty());
    assert_eq!(reconciler.lock().await.available_balance(&address), Some(700));

    fx.backend.confirm(&address, 300);
    let height = fx.backend.mine();
    let resolved = sync.on_block(height).await.unwrap();

    assert_eq!(resolved.len(), 1);
    let reconciler = reconciler.lock().await;
    assert!(reconciler.records().is_empty());
    assert_eq!(reconciler.available_balance(&address), Some(700));

    let record = fx.engine.record(&fx.key(), Coin::Ethereum).unwrap();
    assert_eq!(record.addresses[0].nonce, Some(2));
    assert_eq!(record.addresses[0].balance.as_deref(), Some("700"));
}

#[tokio::test]
async fn test_block_notifications_drive_sync() {
    let fx = Fixture::new().await;
    fx.fund(Coin::Ethereum, 0, 1_000, 1);
    fx.engine.start(&fx.descriptor, Coin::Ethereum).await.unwrap();

    let address = fx.address(Coin::Ethereum, 0);
    let reconciler = Arc::new(Mutex::new(PendingReconciler::new(Coin::Ethereum)));
    reconciler.lock().await.add(PendingTransaction {
        address: address.clone(),
        ..pending("0xaa", 1, 300)
    });

    let sync = BlockSync::new(fx.engine.clone(), Coin::Ethereum, reconciler.clone());
    let handle = sync.spawn(fx.channel.subscribe_events());
    fx.channel.subscribe(SubscribeRequest::Block).await.unwrap();

    fx.backend.confirm(&address, 300);
    fx.backend.mine();

    let watched = reconciler.clone();
    let resolved = eventually(move || {
        watched
            .try_lock()
            .map_or(false, |r| r.records().is_empty())
    })
    .await;
    assert!(resolved);
    assert_eq!(
        reconciler.lock().await.available_balance(&address),
        Some(700)
    );

    handle.abort();
}
