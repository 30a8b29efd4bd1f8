//! Message transport between the channel and its worker
//!
//! The worker shares no memory with the channel: both ends only exchange
//! serialized JSON strings over unbounded queues. The worker side can also
//! signal a runtime fault, which is distinct from a business error response.

use tokio::sync::mpsc;

use super::message::LinkMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    Message(String),
    Fault(String),
}

/// Channel side of the transport
pub struct WorkerPort {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<WorkerSignal>,
}

/// Worker side of the transport
pub struct WorkerEndpoint {
    pub inbox: mpsc::UnboundedReceiver<String>,
    pub outbox: mpsc::UnboundedSender<WorkerSignal>,
}

pub fn pair() -> (WorkerPort, WorkerEndpoint) {
    let (outbound, inbox) = mpsc::unbounded_channel();
    let (outbox, inbound) = mpsc::unbounded_channel();
    (
        WorkerPort { outbound, inbound },
        WorkerEndpoint { inbox, outbox },
    )
}

impl WorkerEndpoint {
    /// Next well-formed message from the channel; `None` once the channel hung up
    pub async fn next(&mut self) -> Option<LinkMessage> {
        loop {
            let raw = self.inbox.recv().await?;
            match LinkMessage::from_json(&raw) {
                Ok(message) => return Some(message),
                Err(e) => log::warn!("Worker dropped malformed message: {}", e),
            }
        }
    }

    pub fn outbox(&self) -> Outbox {
        Outbox(self.outbox.clone())
    }

    pub fn post(&self, message: &LinkMessage) -> bool {
        self.outbox().post(message)
    }

    pub fn fault(&self, reason: impl Into<String>) {
        self.outbox().fault(reason)
    }
}

/// Cloneable sending half of a worker endpoint
#[derive(Clone)]
pub struct Outbox(mpsc::UnboundedSender<WorkerSignal>);

impl Outbox {
    /// Returns false if the channel side is gone
    pub fn post(&self, message: &LinkMessage) -> bool {
        match message.to_json() {
            Ok(raw) => self.0.send(WorkerSignal::Message(raw)).is_ok(),
            Err(e) => {
                log::error!("Cannot serialize {:?}: {}", message.kind, e);
                false
            }
        }
    }

    pub fn post_raw(&self, raw: impl Into<String>) -> bool {
        self.0.send(WorkerSignal::Message(raw.into())).is_ok()
    }

    pub fn fault(&self, reason: impl Into<String>) {
        let _ = self.0.send(WorkerSignal::Fault(reason.into()));
    }
}
