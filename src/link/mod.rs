//! Link Channel to the isolated backend worker
//!
//! - `message` - `{ id, type, payload }` wire messages
//! - `types` - typed payloads and link events
//! - `transport` - the queue pair connecting channel and worker
//! - `channel` - correlated calls, event fan-out, fault handling

pub mod channel;
pub mod message;
pub mod transport;
pub mod types;

pub use channel::LinkChannel;
pub use message::{LinkMessage, MessageType, EVENT_ID};
pub use transport::{pair, Outbox, WorkerEndpoint, WorkerPort, WorkerSignal};
pub use types::{
    AccountInfo, BlockNotification, FeeEstimate, LinkEvent, Notification, ServerInfo,
    SubscribeRequest, TransactionSummary,
};
