//! Pending Reconciler
//!
//! Broadcast-but-unconfirmed transactions are remembered per address and
//! subtracted from the authoritative balance until the backend shows their
//! nonce as used. A failed broadcast stays in the list as `rejected` for the
//! rest of the session but no longer counts against the balance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::coin::Coin;
use crate::error::LinkError;
use crate::link::types::AccountInfo;
use crate::link::LinkChannel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    /// Txid once broadcast, provisional id before
    pub id: String,
    pub address: String,
    pub nonce: u64,
    #[serde(with = "amount_string")]
    pub amount: u128,
    /// Currency shortcut, e.g. "ETH"
    pub currency: String,
    pub rejected: bool,
    pub created_at: DateTime<Utc>,
}

/// A signed transaction about to be broadcast
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub address: String,
    pub nonce: u64,
    pub amount: u128,
    pub hex: String,
}

/// Where signed transactions are pushed to
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn push_transaction(&self, hex: &str) -> Result<String, LinkError>;
}

#[async_trait]
impl TransactionSink for LinkChannel {
    async fn push_transaction(&self, hex: &str) -> Result<String, LinkError> {
        LinkChannel::push_transaction(self, hex).await
    }
}

pub struct PendingReconciler {
    coin: Coin,
    pending: Vec<PendingTransaction>,
    /// Authoritative balances by lowercase address
    balances: HashMap<String, u128>,
}

impl PendingReconciler {
    pub fn new(coin: Coin) -> Self {
        Self {
            coin,
            pending: Vec::new(),
            balances: HashMap::new(),
        }
    }

    pub fn coin(&self) -> Coin {
        self.coin
    }

    /// Remember a transaction
    ///
    /// A live entry with the same address and nonce is replaced. Rejected
    /// entries are kept.
    pub fn add(&mut self, transaction: PendingTransaction) {
        self.pending.retain(|p| {
            p.rejected
                || !(p.address.eq_ignore_ascii_case(&transaction.address)
                    && p.nonce == transaction.nonce)
        });
        log::debug!(
            "Pending {} {} from {} (nonce {})",
            transaction.amount,
            transaction.currency,
            transaction.address,
            transaction.nonce
        );
        self.pending.push(transaction);
    }

    pub fn reject(&mut self, id: &str) -> bool {
        match self.pending.iter_mut().find(|p| p.id == id) {
            Some(transaction) => {
                transaction.rejected = true;
                true
            }
            None => false,
        }
    }

    /// Fold in fresh backend state for one address
    ///
    /// Stores the balance and resolves every non-rejected pending
    /// transaction whose nonce the backend already counts. Returns the
    /// resolved transactions.
    pub fn observe(&mut self, info: &AccountInfo) -> Vec<PendingTransaction> {
        match info.balance_units() {
            Ok(balance) => {
                self.balances.insert(info.address.to_lowercase(), balance);
            }
            Err(e) => log::warn!("Ignoring balance of {}: {}", info.address, e),
        }

        let (resolved, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| {
            !p.rejected
                && p.address.eq_ignore_ascii_case(&info.address)
                && p.nonce < info.transaction_count
        });
        self.pending = kept;

        for transaction in &resolved {
            log::info!(
                "Pending transaction {} of {} confirmed (nonce {})",
                transaction.id,
                transaction.address,
                transaction.nonce
            );
        }
        resolved
    }

    pub fn observe_all(&mut self, infos: &[AccountInfo]) -> Vec<PendingTransaction> {
        infos.iter().flat_map(|info| self.observe(info)).collect()
    }

    /// Authoritative balance minus everything still pending
    ///
    /// `None` until a balance was observed. A negative value means more is
    /// pending than the backend reflects yet; it is logged, not raised.
    pub fn available_balance(&self, address: &str) -> Option<i128> {
        let balance = *self.balances.get(&address.to_lowercase())?;
        let available = signed(balance).saturating_sub(signed(self.pending_amount(address)));
        if available < 0 {
            log::warn!(
                "Pending amount of {} exceeds its balance by {}",
                address,
                -available
            );
        }
        Some(available)
    }

    /// Sum of non-rejected pending amounts in this coin's currency
    pub fn pending_amount(&self, address: &str) -> u128 {
        let currency = self.coin.shortcut();
        self.pending_for(address)
            .filter(|p| !p.rejected && p.currency == currency)
            .map(|p| p.amount)
            .sum()
    }

    pub fn pending_for<'a>(
        &'a self,
        address: &'a str,
    ) -> impl Iterator<Item = &'a PendingTransaction> + 'a {
        self.pending
            .iter()
            .filter(move |p| p.address.eq_ignore_ascii_case(address))
    }

    /// Next nonce implied by the non-rejected pending transactions
    pub fn pending_nonce(&self, address: &str) -> Option<u64> {
        self.pending_for(address)
            .filter(|p| !p.rejected)
            .map(|p| p.nonce + 1)
            .max()
    }

    pub fn records(&self) -> &[PendingTransaction] {
        &self.pending
    }

    pub fn load(&mut self, records: Vec<PendingTransaction>) {
        for record in records {
            self.add(record);
        }
    }

    /// Push a signed transaction, tracking it optimistically
    ///
    /// The record is added under a provisional id before the push and takes
    /// the txid on success. A failed push leaves it marked rejected.
    pub async fn broadcast(
        &mut self,
        sink: &dyn TransactionSink,
        draft: TransactionDraft,
    ) -> Result<String, LinkError> {
        let provisional = Uuid::new_v4().to_string();
        self.add(PendingTransaction {
            id: provisional.clone(),
            address: draft.address.clone(),
            nonce: draft.nonce,
            amount: draft.amount,
            currency: self.coin.shortcut().to_string(),
            rejected: false,
            created_at: Utc::now(),
        });

        match sink.push_transaction(&draft.hex).await {
            Ok(txid) => {
                if let Some(record) = self.pending.iter_mut().find(|p| p.id == provisional) {
                    record.id = txid.clone();
                }
                Ok(txid)
            }
            Err(e) => {
                log::warn!(
                    "Broadcast from {} (nonce {}) rejected: {}",
                    draft.address,
                    draft.nonce,
                    e
                );
                self.reject(&provisional);
                Err(e)
            }
        }
    }
}

fn signed(amount: u128) -> i128 {
    i128::try_from(amount).unwrap_or(i128::MAX)
}

mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";

    fn pending(nonce: u64, amount: u128) -> PendingTransaction {
        PendingTransaction {
            id: format!("tx-{}", nonce),
            address: ADDRESS.to_string(),
            nonce,
            amount,
            currency: "ETH".into(),
            rejected: false,
            created_at: Utc::now(),
        }
    }

    fn account(balance: &str, transaction_count: u64) -> AccountInfo {
        AccountInfo {
            address: ADDRESS.to_lowercase(),
            balance: balance.into(),
            transaction_count,
            block_height: 10,
        }
    }

    #[test]
    fn test_same_nonce_replaces() {
        let mut reconciler = PendingReconciler::new(Coin::Ethereum);
        reconciler.add(pending(1, 10));
        reconciler.add(PendingTransaction {
            id: "speedup".into(),
            ..pending(1, 12)
        });
        assert_eq!(reconciler.records().len(), 1);
        assert_eq!(reconciler.records()[0].id, "speedup");
    }

    #[test]
    fn test_pending_nonce() {
        let mut reconciler = PendingReconciler::new(Coin::Ethereum);
        assert_eq!(reconciler.pending_nonce(ADDRESS), None);

        reconciler.add(pending(3, 1));
        reconciler.add(pending(4, 1));
        reconciler.reject("tx-4");
        assert_eq!(reconciler.pending_nonce(ADDRESS), Some(4));
    }

    #[test]
    fn test_negative_available_balance_is_not_an_error() {
        let mut reconciler = PendingReconciler::new(Coin::Ethereum);
        reconciler.add(pending(0, 50));
        reconciler.observe(&account("20", 0));
        assert_eq!(reconciler.available_balance(ADDRESS), Some(-30));
    }

    #[test]
    fn test_huge_balance_saturates() {
        let mut reconciler = PendingReconciler::new(Coin::Ethereum);
        reconciler.add(pending(0, 1));
        reconciler.observe(&account(&u128::MAX.to_string(), 0));
        assert_eq!(reconciler.available_balance(ADDRESS), Some(i128::MAX - 1));
    }

    #[test]
    fn test_rejected_entry_survives_same_nonce() {
        let mut reconciler = PendingReconciler::new(Coin::Ethereum);
        reconciler.add(pending(1, 10));
        reconciler.reject("tx-1");
        reconciler.add(PendingTransaction {
            id: "retry".into(),
            ..pending(1, 10)
        });
        assert_eq!(reconciler.records().len(), 2);
        assert_eq!(reconciler.pending_amount(ADDRESS), 10);
    }

    #[test]
    fn test_amount_serialized_as_string() {
        let value = serde_json::to_value(pending(1, 1_000_000_000_000_000_000)).unwrap();
        assert_eq!(value["amount"], "1000000000000000000");
        let back: PendingTransaction = serde_json::from_value(value).unwrap();
        assert_eq!(back.amount, 1_000_000_000_000_000_000);
    }
}
