//! Link Channel
//!
//! Typed call/response/event API over a worker transport. Each call gets a
//! fresh id and a slot in the pending table; the reader task resolves the
//! slot whose id matches an incoming response, in whatever order responses
//! arrive. Messages carrying [`EVENT_ID`](super::message::EVENT_ID) are
//! re-broadcast as [`LinkEvent`]s.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::message::{LinkMessage, MessageType};
use super::transport::{WorkerPort, WorkerSignal};
use super::types::*;
use crate::config::{LinkConfig, LinkSettings};
use crate::error::LinkError;

const EVENT_CAPACITY: usize = 64;

type PendingCall = oneshot::Sender<Result<Value, LinkError>>;

enum ChannelState {
    Idle,
    Ready {
        outbound: mpsc::UnboundedSender<String>,
        reader: JoinHandle<()>,
    },
    Faulted(String),
    Disposed,
}

struct Shared {
    state: Mutex<ChannelState>,
    pending: Mutex<HashMap<i64, PendingCall>>,
    next_id: AtomicI64,
    events: broadcast::Sender<LinkEvent>,
}

pub struct LinkChannel {
    shared: Arc<Shared>,
    settings: LinkSettings,
    handshake_timeout: Duration,
}

impl LinkChannel {
    pub fn new(config: &LinkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState::Idle),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(0),
                events,
            }),
            settings: config.settings(),
            handshake_timeout: config.handshake_timeout,
        }
    }

    /// Perform the handshake with a freshly spawned worker
    ///
    /// Waits for the worker to announce readiness, replies with the link
    /// settings and only then accepts calls. A worker fault or exit before the
    /// announcement fails with `LinkError::Handshake`. Calling `init` again
    /// replaces the previous worker.
    pub async fn init(&self, port: WorkerPort) -> Result<(), LinkError> {
        let WorkerPort {
            outbound,
            mut inbound,
        } = port;

        self.teardown(Some("Link channel reinitialized"));

        let timeout_ms = self.handshake_timeout.as_millis() as u64;
        tokio::time::timeout(self.handshake_timeout, await_handshake(&mut inbound))
            .await
            .map_err(|_| {
                log::error!("Link worker did not announce readiness within {} ms", timeout_ms);
                LinkError::HandshakeTimeout(timeout_ms)
            })??;

        let reply = LinkMessage::event(MessageType::Handshake, serde_json::to_value(&self.settings)?);
        outbound
            .send(reply.to_json()?)
            .map_err(|_| LinkError::Handshake("worker closed during handshake".into()))?;

        self.shared.next_id.store(0, Ordering::SeqCst);

        let mut state = lock(&self.shared.state);
        let reader = tokio::spawn(read_loop(Arc::clone(&self.shared), inbound));
        *state = ChannelState::Ready { outbound, reader };
        log::info!("Link channel ready ({} at {})", self.settings.name, self.settings.url);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.shared.state), ChannelState::Ready { .. })
    }

    /// Number of calls still awaiting a response
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    pub async fn get_info(&self) -> Result<ServerInfo, LinkError> {
        self.call(MessageType::GetInfo, Value::Null).await
    }

    pub async fn get_account_info(&self, address: &str) -> Result<AccountInfo, LinkError> {
        let request = AddressRequest {
            address: address.to_string(),
        };
        self.call(MessageType::GetAccountInfo, request).await
    }

    pub async fn get_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<TransactionSummary>, LinkError> {
        let request = AddressRequest {
            address: address.to_string(),
        };
        self.call(MessageType::GetTransactions, request).await
    }

    pub async fn get_fee(&self) -> Result<FeeEstimate, LinkError> {
        self.call(MessageType::GetFee, Value::Null).await
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<(), LinkError> {
        let _: Value = self.call(MessageType::Subscribe, request).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, request: SubscribeRequest) -> Result<(), LinkError> {
        let _: Value = self.call(MessageType::Unsubscribe, request).await?;
        Ok(())
    }

    /// Broadcast a signed raw transaction, returning its txid
    pub async fn push_transaction(&self, hex: &str) -> Result<String, LinkError> {
        let request = PushTransactionRequest {
            hex: hex.to_string(),
        };
        self.call(MessageType::PushTransaction, request).await
    }

    /// Ask the worker to drop its backend connection
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let _: Value = self.call(MessageType::Disconnect, Value::Null).await?;
        Ok(())
    }

    async fn call<P, T>(&self, kind: MessageType, payload: P) -> Result<T, LinkError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let (tx, rx) = oneshot::channel();

        let (id, outbound) = {
            let state = lock(&self.shared.state);
            let outbound = match &*state {
                ChannelState::Ready { outbound, .. } => outbound.clone(),
                ChannelState::Idle => return Err(LinkError::NotInitialized),
                ChannelState::Faulted(reason) => return Err(LinkError::Transport(reason.clone())),
                ChannelState::Disposed => return Err(LinkError::Disposed),
            };
            let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
            lock(&self.shared.pending).insert(id, tx);
            (id, outbound)
        };

        let raw = match LinkMessage::new(id, kind, payload).to_json() {
            Ok(raw) => raw,
            Err(e) => {
                lock(&self.shared.pending).remove(&id);
                return Err(e);
            }
        };

        log::debug!("-> #{} {:?}", id, kind);
        if outbound.send(raw).is_err() {
            self.shared.fault("Link worker is gone".to_string());
        }

        let value = rx
            .await
            .map_err(|_| LinkError::Transport(format!("call #{} was dropped", id)))??;
        Ok(serde_json::from_value(value)?)
    }

    /// Shut the worker down and reject everything still pending
    ///
    /// Repeated disposal is a no-op. The channel can be initialized again.
    pub fn dispose(&self) {
        if matches!(*lock(&self.shared.state), ChannelState::Disposed) {
            return;
        }
        self.teardown(None);
        *lock(&self.shared.state) = ChannelState::Disposed;
    }

    /// Release the current worker; `None` rejects pending calls as disposed
    fn teardown(&self, reason: Option<&str>) {
        let previous = std::mem::replace(&mut *lock(&self.shared.state), ChannelState::Idle);
        if let ChannelState::Ready { outbound, reader } = previous {
            // closing the worker inbox is the shutdown request
            drop(outbound);
            reader.abort();
            log::info!("Link worker released");
        }

        let drained: Vec<PendingCall> = lock(&self.shared.pending)
            .drain()
            .map(|(_, call)| call)
            .collect();
        for call in drained {
            let error = match reason {
                Some(reason) => LinkError::Transport(reason.to_string()),
                None => LinkError::Disposed,
            };
            let _ = call.send(Err(error));
        }
    }
}

impl Drop for LinkChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Shared {
    fn dispatch(&self, raw: &str) {
        let message = match LinkMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed link message: {}", e);
                return;
            }
        };

        if message.is_event() {
            self.emit(message);
            return;
        }

        let waiter = lock(&self.pending).remove(&message.id);
        let Some(waiter) = waiter else {
            log::warn!("No pending call #{} for {:?}", message.id, message.kind);
            return;
        };

        log::debug!("<- #{} {:?}", message.id, message.kind);
        let result = match message.kind {
            MessageType::Error => Err(LinkError::Backend(error_message(&message.payload))),
            _ => Ok(message.payload),
        };
        let _ = waiter.send(result);
    }

    fn emit(&self, message: LinkMessage) {
        let event = match message.kind {
            MessageType::Connected => match serde_json::from_value(message.payload) {
                Ok(info) => LinkEvent::Connected(info),
                Err(e) => {
                    log::warn!("Invalid r_connected payload: {}", e);
                    return;
                }
            },
            MessageType::Disconnected => LinkEvent::Disconnected,
            MessageType::Error => LinkEvent::Error(error_message(&message.payload)),
            MessageType::Notification => match serde_json::from_value(message.payload) {
                Ok(notification) => LinkEvent::Notification(notification),
                Err(e) => {
                    log::warn!("Invalid notification payload: {}", e);
                    return;
                }
            },
            other => {
                log::debug!("Ignoring unsolicited {:?}", other);
                return;
            }
        };
        // no listeners is fine
        let _ = self.events.send(event);
    }

    /// Transport-level failure: every pending call is rejected with the same error
    fn fault(&self, reason: String) {
        let drained: Vec<PendingCall> = {
            let mut state = lock(&self.state);
            if matches!(*state, ChannelState::Disposed | ChannelState::Faulted(_)) {
                return;
            }
            *state = ChannelState::Faulted(reason.clone());
            lock(&self.pending).drain().map(|(_, call)| call).collect()
        };

        log::error!(
            "Link transport fault: {} ({} pending calls rejected)",
            reason,
            drained.len()
        );
        for call in drained {
            let _ = call.send(Err(LinkError::Transport(reason.clone())));
        }
        let _ = self.events.send(LinkEvent::Error(reason));
    }
}

async fn await_handshake(
    inbound: &mut mpsc::UnboundedReceiver<WorkerSignal>,
) -> Result<(), LinkError> {
    loop {
        match inbound.recv().await {
            None => return Err(LinkError::Handshake("worker exited before handshake".into())),
            Some(WorkerSignal::Fault(reason)) => {
                log::error!("Link worker fault before handshake: {}", reason);
                return Err(LinkError::Handshake(reason));
            }
            Some(WorkerSignal::Message(raw)) => match LinkMessage::from_json(&raw) {
                Ok(message) if message.kind == MessageType::Handshake => return Ok(()),
                Ok(message) => log::warn!("Unexpected {:?} before handshake", message.kind),
                Err(e) => log::warn!("Malformed message before handshake: {}", e),
            },
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<WorkerSignal>) {
    while let Some(signal) = inbound.recv().await {
        match signal {
            WorkerSignal::Message(raw) => shared.dispatch(&raw),
            WorkerSignal::Fault(reason) => {
                shared.fault(reason);
                return;
            }
        }
    }
    shared.fault("Link worker terminated".to_string());
}

fn error_message(payload: &Value) -> String {
    match serde_json::from_value::<ErrorPayload>(payload.clone()) {
        Ok(error) => error.message,
        Err(_) => match payload {
            Value::String(message) => message.clone(),
            Value::Null => "unknown error".to_string(),
            other => other.to_string(),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
