//! Error types for link, device and discovery operations
//!
//! Follows the fault taxonomy the rest of the crate relies on:
//! transport faults reject every pending call, backend errors reject a
//! single call, device faults are retryable, address mismatches are fatal.

use crate::coin::Coin;
use thiserror::Error;

/// Errors raised by the link channel and its worker
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link channel is not initialized")]
    NotInitialized,

    #[error("Link handshake failed: {0}")]
    Handshake(String),

    #[error("Link handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Link transport fault: {0}")]
    Transport(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Link channel disposed")]
    Disposed,

    #[error("Invalid link payload: {0}")]
    InvalidPayload(String),
}

impl LinkError {
    /// Whether the channel itself is unusable after this error
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::NotInitialized | Self::Disposed | Self::Handshake(_)
                | Self::HandshakeTimeout(_)
        )
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

/// Classification of hardware communication failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFaultKind {
    Timeout,
    Disconnected,
    Rejected,
    Failure,
}

/// A failed call to the physical device
///
/// Always retryable: the caller may repeat the same step without advancing state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Device {kind:?}: {message}")]
pub struct DeviceFault {
    pub kind: DeviceFaultKind,
    pub message: String,
}

impl DeviceFault {
    pub fn new(kind: DeviceFaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(DeviceFaultKind::Disconnected, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(DeviceFaultKind::Rejected, message)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Device(#[from] DeviceFault),

    #[error("Addresses are different at index {index}. device: {device}, derived: {derived}")]
    AddressMismatch {
        index: u32,
        device: String,
        derived: String,
    },

    #[error("Device is not authenticated yet")]
    NotAuthenticated,

    #[error("No discovery record for {0}")]
    NotFound(String),

    #[error("No backend registered for {0}")]
    NoBackend(Coin),

    #[error("Unknown coin: {0}")]
    UnknownCoin(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Derivation error: {0}")]
    Derivation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The action a user can take to recover from a [`DiscoveryError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Repeat the failed step; already-confirmed addresses are kept
    TryAgain,
    /// Restart discovery from index 0
    StartOver,
    /// The link channel must be initialized again
    Reinitialize,
    None,
}

impl DiscoveryError {
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::Device(_) => Recovery::TryAgain,
            Self::Link(e) if e.is_transport() => Recovery::Reinitialize,
            Self::Link(_) => Recovery::TryAgain,
            Self::AddressMismatch { .. } => Recovery::StartOver,
            _ => Recovery::None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.recovery() == Recovery::TryAgain
    }

    /// Short title for a user-facing notification
    pub fn title(&self) -> &'static str {
        match self {
            Self::AddressMismatch { .. } => "Address validation error",
            Self::Device(_) => "Device communication error",
            Self::Link(_) => "Backend error",
            Self::NotAuthenticated => "Authentication error",
            _ => "Discovery error",
        }
    }
}
