//! hwlink-discovery: Hardware Wallet Account Discovery
//!
//! This crate learns which accounts and balances a hardware device owns on
//! an Ethereum-family network. Addresses are derived in software from the
//! device's extended public key, confirmed one by one on the device itself,
//! and probed on a backend reached through an isolated link worker.
//!
//! # Architecture
//!
//! - **Link Channel**: correlated request/response/event protocol to the link worker
//! - **Link Worker**: owns the backend connection (in-memory or Ethereum JSON-RPC)
//! - **Address Sequencer**: non-hardened child derivation from an xpub
//! - **Device Verifier**: cross-checks every address on the hardware
//! - **Discovery Engine**: resumable, interruptible scan per device identity and coin
//! - **Pending Reconciler**: optimistic in-flight transactions against confirmed state
//!
//! # Example
//!
//! ```ignore
//! use hwlink_discovery::{
//!     authenticate, spawn_worker, Coin, DiscoveryEngine, JsonRpcBackend, LinkChannel,
//!     LinkConfig, SessionRegistry, SoftwareDevice,
//! };
//!
//! let config = LinkConfig::from_env();
//! let channel = Arc::new(LinkChannel::new(&config));
//! channel
//!     .init(spawn_worker(Arc::new(JsonRpcBackend::new(&config.backend_url, config.coin))))
//!     .await?;
//!
//! let device = Arc::new(SoftwareDevice::from_mnemonic(&phrase, "")?);
//! let descriptor = authenticate(device.as_ref(), &device.descriptor("emulator")).await?;
//!
//! let engine = DiscoveryEngine::new(device, SessionRegistry::new(), backends);
//! let status = engine.start(&descriptor, Coin::Ethereum).await?;
//! ```

// Public modules
pub mod address;
pub mod coin;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod link;
pub mod pending;
pub mod sequencer;
pub mod session;
pub mod storage;
pub mod sync;
pub mod worker;

// Re-exports for convenience
pub use address::{public_key_to_address, to_checksum_address};
pub use coin::Coin;
pub use config::{LinkConfig, LinkSettings};
pub use device::{
    authenticate, DeviceConnector, DeviceDescriptor, DeviceKey, DeviceVerifier,
    PublicKeyResponse, SessionOptions, SoftwareDevice,
};
pub use discovery::{
    AccountSource, AddressRecord, DiscoveryEngine, DiscoveryEvent, DiscoveryRecord,
    DiscoveryStatus,
};
pub use error::{DeviceFault, DeviceFaultKind, DiscoveryError, LinkError, Recovery, StorageError};
pub use link::{AccountInfo, LinkChannel, LinkEvent, Notification, SubscribeRequest};
pub use pending::{PendingReconciler, PendingTransaction, TransactionDraft, TransactionSink};
pub use sequencer::{AddressSequencer, DerivedAddress};
pub use session::{SessionHandle, SessionOwner, SessionRegistry};
pub use storage::{SnapshotStore, WalletSnapshot};
pub use sync::BlockSync;
pub use worker::{spawn_worker, Backend, BackendError, JsonRpcBackend, MemoryBackend};

// Common result type
pub type Result<T> = std::result::Result<T, DiscoveryError>;
