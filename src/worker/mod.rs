//! Link worker
//!
//! Runs in its own task and owns the backend connection. The only way in or
//! out is the serialized message transport, so the channel never touches the
//! backend directly.
//!
//! Lifecycle:
//! 1. announce readiness (`m_handshake`) and wait for the link settings
//! 2. query the backend once, emit `r_connected` (or `r_error`)
//! 3. serve requests, each in its own task, while polling for new blocks
//!    when something is subscribed
//! 4. when the channel hangs up, disconnect the backend and exit

pub mod handlers;
pub mod json_rpc;
pub mod memory;

pub use json_rpc::JsonRpcBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::config::LinkSettings;
use crate::link::message::{LinkMessage, MessageType};
use crate::link::transport::{self, Outbox, WorkerEndpoint, WorkerPort};
use crate::link::types::{AccountInfo, BlockNotification, Notification, ServerInfo, SubscribeRequest};
use crate::link::types::{FeeEstimate, TransactionSummary};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("Not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Blockchain backend reachable only from inside the worker
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn info(&self) -> Result<ServerInfo, BackendError>;

    async fn account_info(&self, address: &str) -> Result<AccountInfo, BackendError>;

    async fn transactions(&self, address: &str) -> Result<Vec<TransactionSummary>, BackendError>;

    async fn fee(&self) -> Result<FeeEstimate, BackendError>;

    /// Broadcast a signed transaction and return its txid
    async fn push_transaction(&self, hex: &str) -> Result<String, BackendError>;

    async fn disconnect(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Spawn a worker around `backend` and return the channel side of its transport
pub fn spawn_worker(backend: Arc<dyn Backend>) -> WorkerPort {
    let (port, endpoint) = transport::pair();
    tokio::spawn(run(backend, endpoint));
    port
}

#[derive(Default)]
struct Subscriptions {
    blocks: bool,
    /// Watched addresses (lowercase) with their last seen transaction count
    addresses: HashMap<String, Option<u64>>,
}

impl Subscriptions {
    fn is_active(&self) -> bool {
        self.blocks || !self.addresses.is_empty()
    }
}

struct Worker {
    backend: Arc<dyn Backend>,
    outbox: Outbox,
    settings: LinkSettings,
    subscriptions: Subscriptions,
    tip: Option<u64>,
}

async fn run(backend: Arc<dyn Backend>, mut endpoint: WorkerEndpoint) {
    endpoint.post(&LinkMessage::event(MessageType::Handshake, Value::Null));

    let settings = match await_settings(&mut endpoint).await {
        Some(settings) => settings,
        None => return,
    };
    if settings.debug {
        log::debug!("Worker settings: {:?}", settings);
    }

    let mut worker = Worker {
        backend,
        outbox: endpoint.outbox(),
        settings,
        subscriptions: Subscriptions::default(),
        tip: None,
    };
    worker.connect().await;

    let period = Duration::from_millis(worker.settings.poll_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = endpoint.next() => match message {
                Some(message) => worker.handle(message),
                None => break,
            },
            _ = ticker.tick(), if worker.subscriptions.is_active() => worker.poll().await,
        }
    }

    if let Err(e) = worker.backend.disconnect().await {
        log::warn!("Backend disconnect failed: {}", e);
    }
    log::info!("Link worker for {} stopped", worker.settings.name);
}

async fn await_settings(endpoint: &mut WorkerEndpoint) -> Option<LinkSettings> {
    while let Some(message) = endpoint.next().await {
        if message.kind != MessageType::Handshake {
            log::warn!("Worker ignored {:?} before handshake", message.kind);
            continue;
        }
        return match serde_json::from_value::<LinkSettings>(message.payload) {
            Ok(settings) => Some(settings),
            Err(e) => {
                endpoint.fault(format!("Invalid link settings: {}", e));
                None
            }
        };
    }
    log::debug!("Channel closed before handshake");
    None
}

impl Worker {
    async fn connect(&mut self) {
        match self.backend.info().await {
            Ok(info) => {
                log::info!(
                    "Worker connected to {} at {} (height {})",
                    info.name,
                    self.settings.url,
                    info.block_height
                );
                self.tip = Some(info.block_height);
                match serde_json::to_value(&info) {
                    Ok(payload) => {
                        self.outbox
                            .post(&LinkMessage::event(MessageType::Connected, payload));
                    }
                    Err(e) => log::error!("Cannot serialize server info: {}", e),
                }
            }
            Err(e) => {
                log::error!("Worker could not reach {}: {}", self.settings.url, e);
                self.outbox.post(&LinkMessage::event(
                    MessageType::Error,
                    json!({ "message": e.to_string() }),
                ));
            }
        }
    }

    fn handle(&mut self, message: LinkMessage) {
        match message.kind {
            MessageType::Subscribe => {
                let reply = self.update_subscriptions(&message, true);
                self.outbox.post(&reply);
            }
            MessageType::Unsubscribe => {
                let reply = self.update_subscriptions(&message, false);
                self.outbox.post(&reply);
            }
            MessageType::Handshake => log::debug!("Worker ignored repeated handshake"),
            kind if kind.response().is_some() => {
                let backend = Arc::clone(&self.backend);
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let reply = handlers::dispatch(backend.as_ref(), message).await;
                    outbox.post(&reply);
                });
            }
            kind => {
                self.outbox.post(&LinkMessage::error(
                    message.id,
                    format!("Unsupported message type {:?}", kind),
                ));
            }
        }
    }

    fn update_subscriptions(&mut self, message: &LinkMessage, subscribe: bool) -> LinkMessage {
        let request = match serde_json::from_value::<SubscribeRequest>(message.payload.clone()) {
            Ok(request) => request,
            Err(e) => return LinkMessage::error(message.id, format!("Invalid subscription: {}", e)),
        };

        match (request, subscribe) {
            (SubscribeRequest::Block, on) => self.subscriptions.blocks = on,
            (SubscribeRequest::Addresses { addresses }, true) => {
                for address in addresses {
                    self.subscriptions
                        .addresses
                        .entry(address.to_lowercase())
                        .or_insert(None);
                }
            }
            (SubscribeRequest::Addresses { addresses }, false) => {
                for address in addresses {
                    self.subscriptions.addresses.remove(&address.to_lowercase());
                }
            }
        }

        let kind = if subscribe {
            MessageType::Subscribed
        } else {
            MessageType::Unsubscribed
        };
        LinkMessage::new(message.id, kind, json!({ "subscribed": subscribe }))
    }

    /// Check for a new block and notify subscribers
    async fn poll(&mut self) {
        let info = match self.backend.info().await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Block poll failed: {}", e);
                return;
            }
        };

        let previous = self.tip.replace(info.block_height);
        self.record_baselines().await;
        if previous.map_or(false, |height| height >= info.block_height) {
            return;
        }
        if self.settings.debug {
            log::debug!("New block {} ({})", info.block_height, info.block_hash);
        }

        if self.subscriptions.blocks {
            self.notify(Notification::Block(BlockNotification {
                height: info.block_height,
                hash: info.block_hash.clone(),
            }));
        }

        let watched: Vec<String> = self.subscriptions.addresses.keys().cloned().collect();
        for address in watched {
            let account = match self.backend.account_info(&address).await {
                Ok(account) => account,
                Err(e) => {
                    log::warn!("Refresh of watched address {} failed: {}", address, e);
                    continue;
                }
            };
            let last_seen = self
                .subscriptions
                .addresses
                .insert(address, Some(account.transaction_count))
                .flatten();
            if last_seen.map_or(false, |count| count != account.transaction_count) {
                self.notify(Notification::Address(account));
            }
        }
    }

    /// Remember the current transaction count of newly watched addresses
    async fn record_baselines(&mut self) {
        let unseen: Vec<String> = self
            .subscriptions
            .addresses
            .iter()
            .filter(|(_, count)| count.is_none())
            .map(|(address, _)| address.clone())
            .collect();

        for address in unseen {
            match self.backend.account_info(&address).await {
                Ok(account) => {
                    self.subscriptions
                        .addresses
                        .insert(address, Some(account.transaction_count));
                }
                Err(e) => log::warn!("Baseline of watched address {} failed: {}", address, e),
            }
        }
    }

    fn notify(&self, notification: Notification) {
        match serde_json::to_value(&notification) {
            Ok(payload) => {
                self.outbox
                    .post(&LinkMessage::event(MessageType::Notification, payload));
            }
            Err(e) => log::error!("Cannot serialize notification: {}", e),
        }
    }
}
