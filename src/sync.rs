//! Block-driven refresh
//!
//! On every new block the discovered addresses of one coin are queried again
//! and the answers are folded into that coin's pending transactions.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::coin::Coin;
use crate::discovery::DiscoveryEngine;
use crate::error::DiscoveryError;
use crate::link::types::{LinkEvent, Notification};
use crate::pending::{PendingReconciler, PendingTransaction};

#[derive(Clone)]
pub struct BlockSync {
    engine: DiscoveryEngine,
    coin: Coin,
    reconciler: Arc<Mutex<PendingReconciler>>,
}

impl BlockSync {
    pub fn new(engine: DiscoveryEngine, coin: Coin, reconciler: Arc<Mutex<PendingReconciler>>) -> Self {
        Self {
            engine,
            coin,
            reconciler,
        }
    }

    /// Refresh every record of the coin and reconcile pending transactions
    ///
    /// Returns the transactions resolved by this block. Records that could
    /// not be refreshed are skipped; the first such error is returned after
    /// the others were reconciled.
    pub async fn on_block(&self, height: u64) -> Result<Vec<PendingTransaction>, DiscoveryError> {
        log::debug!("Block {} on {}", height, self.coin);

        let mut infos = Vec::new();
        let mut first_error = None;
        for record in self.engine.records_for_coin(self.coin) {
            match self.engine.refresh(&record.device_key, self.coin).await {
                Ok(mut fresh) => infos.append(&mut fresh),
                Err(e) => {
                    log::warn!("Refresh of {} on {} failed: {}", self.coin, record.device_key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let resolved = self.reconciler.lock().await.observe_all(&infos);
        match first_error {
            Some(e) => Err(e),
            None => Ok(resolved),
        }
    }

    /// Follow link events until the channel is gone
    pub fn spawn(self, mut events: broadcast::Receiver<LinkEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Notification(Notification::Block(block))) => {
                        if let Err(e) = self.on_block(block.height).await {
                            log::warn!("Sync of block {} incomplete: {}", block.height, e);
                        }
                    }
                    Ok(LinkEvent::Notification(Notification::Address(info))) => {
                        self.reconciler.lock().await.observe(&info);
                    }
                    Ok(LinkEvent::Disconnected) => log::info!("{} backend disconnected", self.coin),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Block sync skipped {} link events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
