//! In-memory backend
//!
//! Deterministic chain state for development and tests: accounts are set
//! directly, blocks are produced with [`MemoryBackend::mine`], and every
//! account lookup is counted so callers can assert what was queried.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Backend, BackendError};
use crate::address::keccak256;
use crate::coin::Coin;
use crate::link::types::{AccountInfo, FeeEstimate, ServerInfo, TransactionSummary};

const DEFAULT_GAS_PRICE: u64 = 20_000_000_000;

#[derive(Debug, Clone, Default)]
struct Account {
    balance: u128,
    transaction_count: u64,
}

#[derive(Default)]
struct State {
    height: u64,
    accounts: HashMap<String, Account>,
    account_calls: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
    pushed: Vec<String>,
    fail_next_push: Option<String>,
    unreachable: bool,
}

pub struct MemoryBackend {
    coin: Coin,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(coin: Coin) -> Self {
        Self {
            coin,
            state: Mutex::new(State {
                height: 1,
                ..Default::default()
            }),
        }
    }

    pub fn set_account(&self, address: &str, balance: u128, transaction_count: u64) {
        self.lock().accounts.insert(
            address.to_lowercase(),
            Account {
                balance,
                transaction_count,
            },
        );
    }

    /// Record a confirmed outgoing transaction of `amount`
    pub fn confirm(&self, address: &str, amount: u128) {
        let mut state = self.lock();
        let account = state.accounts.entry(address.to_lowercase()).or_default();
        account.transaction_count += 1;
        account.balance = account.balance.saturating_sub(amount);
    }

    /// Produce a block and return the new height
    pub fn mine(&self) -> u64 {
        let mut state = self.lock();
        state.height += 1;
        state.height
    }

    pub fn height(&self) -> u64 {
        self.lock().height
    }

    /// Delay account lookups of `address`
    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.lock().delays.insert(address.to_lowercase(), delay);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Reject the next broadcast with `message`
    pub fn fail_next_push(&self, message: &str) {
        self.lock().fail_next_push = Some(message.to_string());
    }

    pub fn pushed_transactions(&self) -> Vec<String> {
        self.lock().pushed.clone()
    }

    pub fn account_info_calls(&self) -> usize {
        self.lock().account_calls.values().sum()
    }

    pub fn account_info_calls_for(&self, address: &str) -> usize {
        self.lock()
            .account_calls
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_reachable(&self) -> Result<(), BackendError> {
        if self.lock().unreachable {
            Err(BackendError::Unreachable("memory backend offline".into()))
        } else {
            Ok(())
        }
    }

    fn block_hash(height: u64) -> String {
        format!("0x{}", hex::encode(keccak256(&height.to_be_bytes())))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn info(&self) -> Result<ServerInfo, BackendError> {
        self.ensure_reachable()?;
        let height = self.height();
        Ok(ServerInfo {
            name: format!("memory-{}", self.coin),
            shortcut: self.coin.shortcut().to_string(),
            block_height: height,
            block_hash: Self::block_hash(height),
        })
    }

    async fn account_info(&self, address: &str) -> Result<AccountInfo, BackendError> {
        self.ensure_reachable()?;
        let key = address.to_lowercase();
        if !key.starts_with("0x") || key.len() != 42 {
            return Err(BackendError::Rejected(format!("Invalid address {}", address)));
        }

        let delay = {
            let mut state = self.lock();
            *state.account_calls.entry(key.clone()).or_insert(0) += 1;
            state.delays.get(&key).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        let account = state.accounts.get(&key).cloned().unwrap_or_default();
        Ok(AccountInfo {
            address: address.to_string(),
            balance: account.balance.to_string(),
            transaction_count: account.transaction_count,
            block_height: state.height,
        })
    }

    async fn transactions(&self, _address: &str) -> Result<Vec<TransactionSummary>, BackendError> {
        self.ensure_reachable()?;
        Ok(Vec::new())
    }

    async fn fee(&self) -> Result<FeeEstimate, BackendError> {
        self.ensure_reachable()?;
        Ok(FeeEstimate {
            gas_price: DEFAULT_GAS_PRICE.to_string(),
        })
    }

    async fn push_transaction(&self, hex: &str) -> Result<String, BackendError> {
        self.ensure_reachable()?;
        let mut state = self.lock();
        if let Some(message) = state.fail_next_push.take() {
            return Err(BackendError::Rejected(message));
        }
        state.pushed.push(hex.to_string());
        Ok(format!("0x{}", hex::encode(keccak256(hex.as_bytes()))))
    }
}
