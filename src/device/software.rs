use async_trait::async_trait;
use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::NetworkKind;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{DeviceConnector, DeviceDescriptor, PublicKeyResponse, SessionOptions};
use crate::address::public_key_to_address;
use crate::error::{DeviceFault, DeviceFaultKind, DiscoveryError};
use crate::sequencer::path_to_address_n;

/// Device emulated from a BIP39 mnemonic
///
/// Answers the same calls a hardware device does, derived in software.
/// Used by the `discover` binary and as the base of test devices.
pub struct SoftwareDevice {
    master: Xpriv,
    secp: Secp256k1<All>,
    connected: AtomicBool,
}

impl SoftwareDevice {
    pub fn from_mnemonic(phrase: &str, passphrase: &str) -> Result<Self, DiscoveryError> {
        let mnemonic = Mnemonic::parse(phrase)
            .map_err(|e| DiscoveryError::Derivation(format!("Invalid mnemonic: {}", e)))?;
        let seed = mnemonic.to_seed(passphrase);
        let master = Xpriv::new_master(NetworkKind::Main, &seed)
            .map_err(|e| DiscoveryError::Derivation(e.to_string()))?;

        Ok(Self {
            master,
            secp: Secp256k1::new(),
            connected: AtomicBool::new(true),
        })
    }

    /// Master key fingerprint, used as the device id
    pub fn device_id(&self) -> String {
        self.master.fingerprint(&self.secp).to_string()
    }

    pub fn descriptor(&self, transport_path: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            connected: self.is_connected(),
            ..DeviceDescriptor::new(transport_path, self.device_id())
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn xpub_at(&self, path: &DerivationPath) -> Result<Xpub, DeviceFault> {
        let derived = self
            .master
            .derive_priv(&self.secp, path)
            .map_err(|e| DeviceFault::new(DeviceFaultKind::Failure, e.to_string()))?;
        Ok(Xpub::from_priv(&self.secp, &derived))
    }

    /// Address at `path`, computed synchronously
    pub fn address_at(&self, path: &DerivationPath) -> Result<String, DeviceFault> {
        let xpub = self.xpub_at(path)?;
        Ok(public_key_to_address(&xpub.public_key))
    }

    fn ensure_connected(&self) -> Result<(), DeviceFault> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DeviceFault::disconnected("Device disconnected"))
        }
    }
}

#[async_trait]
impl DeviceConnector for SoftwareDevice {
    async fn derive_public_key(
        &self,
        path: &DerivationPath,
        _session: &SessionOptions,
    ) -> Result<PublicKeyResponse, DeviceFault> {
        self.ensure_connected()?;
        let xpub = self.xpub_at(path)?;
        let encoded = xpub.encode();

        Ok(PublicKeyResponse {
            public_key: hex::encode(&encoded[45..78]),
            chain_code: hex::encode(&encoded[13..45]),
            path: path_to_address_n(path),
            xpub: Some(xpub.to_string()),
        })
    }

    async fn derive_address(
        &self,
        path: &DerivationPath,
        _session: &SessionOptions,
        show_on_device: bool,
    ) -> Result<String, DeviceFault> {
        self.ensure_connected()?;
        let address = self.address_at(path)?;
        if show_on_device {
            log::info!("[device {}] {}", self.device_id(), address);
        }
        // devices answer in lowercase; callers normalize
        Ok(address.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn options() -> SessionOptions {
        SessionOptions {
            device_path: "emulator".into(),
            instance: None,
            state: None,
            keep_session: false,
        }
    }

    #[tokio::test]
    async fn test_known_address() {
        let device = SoftwareDevice::from_mnemonic(ABANDON, "").unwrap();
        let path = DerivationPath::from_str("m/44'/60'/0'/0/0").unwrap();
        let address = device.derive_address(&path, &options(), false).await.unwrap();
        assert_eq!(address, "0x9858effd232b4033e47d90003d41ec34ecaeda94");
    }

    #[tokio::test]
    async fn test_passphrase_changes_identity() {
        let plain = SoftwareDevice::from_mnemonic(ABANDON, "").unwrap();
        let hidden = SoftwareDevice::from_mnemonic(ABANDON, "secret").unwrap();
        let path = DerivationPath::from_str("m/1'/0'/0'").unwrap();

        let a = plain.derive_public_key(&path, &options()).await.unwrap();
        let b = hidden.derive_public_key(&path, &options()).await.unwrap();
        assert_ne!(a.xpub, b.xpub);
    }

    #[tokio::test]
    async fn test_disconnected_device_faults() {
        let device = SoftwareDevice::from_mnemonic(ABANDON, "").unwrap();
        device.set_connected(false);
        let path = DerivationPath::from_str("m/44'/60'/0'/0/0").unwrap();
        let err = device
            .derive_address(&path, &options(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DeviceFaultKind::Disconnected);
    }
}
