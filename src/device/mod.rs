//! Hardware device capability
//!
//! - `DeviceConnector` - the external device API (public key and address derivation)
//! - `DeviceDescriptor` / `DeviceKey` - which physical device and which identity on it
//! - `verifier` - cross-checks software-derived addresses on the device
//! - `software` - a mnemonic-backed device for development and tests

pub mod software;
pub mod verifier;

pub use software::SoftwareDevice;
pub use verifier::DeviceVerifier;

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{DeviceFault, DiscoveryError};
use crate::sequencer::{path_to_address_n, xpub_from_parts};

/// Path whose public key identifies a device + passphrase combination
pub const STATE_PATH: &str = "m/1'/0'/0'";

/// Addressing of a device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Transport path of the physical device
    pub device_path: String,
    pub instance: Option<u32>,
    /// Expected identity checksum; the device refuses calls under another identity
    pub state: Option<String>,
    /// Keep the device session acquired after this call
    pub keep_session: bool,
}

/// Public key node returned by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    /// Compressed secp256k1 key, hex
    pub public_key: String,
    pub chain_code: String,
    pub path: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xpub: Option<String>,
}

#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn derive_public_key(
        &self,
        path: &DerivationPath,
        session: &SessionOptions,
    ) -> Result<PublicKeyResponse, DeviceFault>;

    async fn derive_address(
        &self,
        path: &DerivationPath,
        session: &SessionOptions,
        show_on_device: bool,
    ) -> Result<String, DeviceFault>;
}

/// A plugged-in or remembered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub path: String,
    pub device_id: String,
    pub instance: Option<u32>,
    /// Identity checksum, present once the device was authenticated
    pub state: Option<String>,
    pub connected: bool,
}

impl DeviceDescriptor {
    pub fn new(path: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device_id: device_id.into(),
            instance: None,
            state: None,
            connected: true,
        }
    }

    pub fn key(&self) -> Result<DeviceKey, DiscoveryError> {
        let state = self.state.clone().ok_or(DiscoveryError::NotAuthenticated)?;
        Ok(DeviceKey {
            device_id: self.device_id.clone(),
            instance: self.instance,
            state,
        })
    }

    pub fn session_options(&self, keep_session: bool) -> SessionOptions {
        SessionOptions {
            device_path: self.path.clone(),
            instance: self.instance,
            state: self.state.clone(),
            keep_session,
        }
    }
}

/// Identity a discovery record is bound to
///
/// Two instances of the same physical device under different passphrases
/// have different `state`, so they never share records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKey {
    pub device_id: String,
    pub instance: Option<u32>,
    pub state: String,
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instance {
            Some(instance) => write!(f, "{}:{}", self.device_id, instance),
            None => f.write_str(&self.device_id),
        }
    }
}

/// Ask the device for its identity checksum and return the authenticated descriptor
pub async fn authenticate(
    connector: &dyn DeviceConnector,
    descriptor: &DeviceDescriptor,
) -> Result<DeviceDescriptor, DiscoveryError> {
    let path = DerivationPath::from_str(STATE_PATH)
        .map_err(|e| DiscoveryError::Derivation(e.to_string()))?;

    let options = SessionOptions {
        state: None,
        ..descriptor.session_options(false)
    };
    let response = connector.derive_public_key(&path, &options).await?;

    let state = match response.xpub {
        Some(xpub) => xpub,
        None => xpub_from_parts(&response.public_key, &response.chain_code, &path)?.to_string(),
    };

    if response.path != path_to_address_n(&path) {
        log::warn!(
            "Device {} answered for path {:?} instead of {}",
            descriptor.device_id,
            response.path,
            STATE_PATH
        );
    }

    log::info!("Device {} authenticated", descriptor.device_id);
    Ok(DeviceDescriptor {
        state: Some(state),
        ..descriptor.clone()
    })
}
