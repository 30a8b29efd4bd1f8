use serde::{Deserialize, Serialize};

use crate::coin::Coin;
use crate::device::DeviceKey;
use crate::error::{DiscoveryError, Recovery};
use crate::link::types::AccountInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryStatus {
    Idle,
    WaitingForDevice,
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl DiscoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Failed)
    }
}

/// One derived and device-confirmed address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub index: u32,
    pub path: Vec<u32>,
    /// EIP-55 checksummed
    pub address: String,
    pub balance: Option<String>,
    pub nonce: Option<u64>,
}

impl AddressRecord {
    /// Fold in fresh backend state; populated fields are only ever overwritten
    pub fn apply(&mut self, info: &AccountInfo) {
        self.balance = Some(info.balance.clone());
        self.nonce = Some(info.transaction_count);
    }

    pub fn balance_units(&self) -> Option<u128> {
        self.balance.as_deref()?.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// Same step may be repeated
    Retryable,
    /// Device and software disagree, the record must start over
    Consistency,
    /// Link channel must be reinitialized
    Transport,
    Other,
}

/// Last error of a failed run, kept on the record for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryFault {
    pub kind: FaultKind,
    pub title: String,
    pub message: String,
}

impl From<&DiscoveryError> for DiscoveryFault {
    fn from(error: &DiscoveryError) -> Self {
        let kind = match error.recovery() {
            Recovery::TryAgain => FaultKind::Retryable,
            Recovery::StartOver => FaultKind::Consistency,
            Recovery::Reinitialize => FaultKind::Transport,
            Recovery::None => FaultKind::Other,
        };
        Self {
            kind,
            title: error.title().to_string(),
            message: error.to_string(),
        }
    }
}

/// Discovery progress of one (device identity, coin) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub coin: Coin,
    pub device_key: DeviceKey,
    pub base_path: String,
    pub extended_public_key: Option<String>,
    pub current_index: u32,
    pub status: DiscoveryStatus,
    pub interrupted: bool,
    pub completed: bool,
    pub waiting_for_device: bool,
    pub addresses: Vec<AddressRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<DiscoveryFault>,
}

impl DiscoveryRecord {
    pub fn new(coin: Coin, device_key: DeviceKey) -> Self {
        Self {
            coin,
            device_key,
            base_path: coin.bip44_path().to_string(),
            extended_public_key: None,
            current_index: 0,
            status: DiscoveryStatus::Idle,
            interrupted: false,
            completed: false,
            waiting_for_device: false,
            addresses: Vec::new(),
            last_fault: None,
        }
    }

    /// Move to `status`, keeping the boolean flags in line with it
    pub fn set_status(&mut self, status: DiscoveryStatus) {
        self.status = status;
        match status {
            DiscoveryStatus::Running => {
                self.interrupted = false;
                self.completed = false;
                self.waiting_for_device = false;
                self.last_fault = None;
            }
            DiscoveryStatus::Completed => {
                self.completed = true;
                self.interrupted = false;
                self.waiting_for_device = false;
            }
            DiscoveryStatus::Interrupted => {
                self.interrupted = true;
                self.waiting_for_device = false;
            }
            DiscoveryStatus::WaitingForDevice => self.waiting_for_device = true,
            DiscoveryStatus::Failed => self.waiting_for_device = false,
            DiscoveryStatus::Idle => {}
        }
    }

    /// Start from index 0 under a freshly obtained extended public key
    pub fn reset(&mut self, extended_public_key: String) {
        self.extended_public_key = Some(extended_public_key);
        self.current_index = 0;
        self.addresses.clear();
        self.completed = false;
        self.interrupted = false;
    }

    pub fn is_running(&self) -> bool {
        self.status == DiscoveryStatus::Running
    }

    pub fn address(&self, index: u32) -> Option<&AddressRecord> {
        self.addresses.iter().find(|a| a.index == index)
    }

    pub fn has_consistency_fault(&self) -> bool {
        self.last_fault
            .as_ref()
            .map_or(false, |fault| fault.kind == FaultKind::Consistency)
    }
}
