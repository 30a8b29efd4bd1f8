use std::sync::Arc;

use super::{DeviceConnector, SessionOptions};
use crate::address::to_checksum_address;
use crate::error::DiscoveryError;
use crate::sequencer::{format_path, DerivedAddress};

/// Confirms a software-derived address against the device
pub struct DeviceVerifier {
    connector: Arc<dyn DeviceConnector>,
    show_on_device: bool,
}

impl DeviceVerifier {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            show_on_device: false,
        }
    }

    /// Also display each verified address on the device screen
    pub fn showing_on_device(mut self, show: bool) -> Self {
        self.show_on_device = show;
        self
    }

    /// Returns the checksummed address both sides agree on
    ///
    /// A device communication failure is a retryable `DiscoveryError::Device`.
    /// A different (or unparseable) device answer is `DiscoveryError::AddressMismatch`,
    /// which must abort the run.
    pub async fn verify(
        &self,
        session: &SessionOptions,
        derived: &DerivedAddress,
    ) -> Result<String, DiscoveryError> {
        let answer = self
            .connector
            .derive_address(&derived.path, session, self.show_on_device)
            .await?;

        let mismatch = || DiscoveryError::AddressMismatch {
            index: derived.index,
            device: answer.clone(),
            derived: derived.address.clone(),
        };

        let device_address = to_checksum_address(&answer).map_err(|_| mismatch())?;
        let software_address = to_checksum_address(&derived.address)?;

        if device_address != software_address {
            log::error!(
                "Inconsistent state at {}: device {} != derived {}",
                format_path(&derived.path),
                device_address,
                software_address
            );
            return Err(mismatch());
        }

        Ok(software_address)
    }
}
