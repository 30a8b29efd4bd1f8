//! Address Sequencer
//!
//! Deterministic child-address generation from an extended public key and an
//! account base path. Only non-hardened derivation is possible here, so the
//! same `(xpub, base_path, index)` always yields the same `(path, address)`
//! on the software side as on the device.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use std::str::FromStr;

use crate::address::public_key_to_address;
use crate::error::DiscoveryError;

/// Mainnet xpub version bytes
const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];

/// One derived child of the account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub index: u32,
    pub path: DerivationPath,
    /// EIP-55 checksummed address
    pub address: String,
}

impl DerivedAddress {
    /// Path as raw child numbers (hardened bit included)
    pub fn address_n(&self) -> Vec<u32> {
        path_to_address_n(&self.path)
    }
}

pub struct AddressSequencer {
    xpub: Xpub,
    base_path: DerivationPath,
    secp: Secp256k1<VerifyOnly>,
}

impl AddressSequencer {
    pub fn new(xpub: Xpub, base_path: DerivationPath) -> Self {
        Self {
            xpub,
            base_path,
            secp: Secp256k1::verification_only(),
        }
    }

    /// Build from the hex public key and chain code a device returns for `base_path`
    pub fn from_public_key(
        public_key_hex: &str,
        chain_code_hex: &str,
        base_path: DerivationPath,
    ) -> Result<Self, DiscoveryError> {
        let xpub = xpub_from_parts(public_key_hex, chain_code_hex, &base_path)?;
        Ok(Self::new(xpub, base_path))
    }

    /// Build from a serialized `xpub...` string
    pub fn from_xpub_str(xpub: &str, base_path: DerivationPath) -> Result<Self, DiscoveryError> {
        let xpub =
            Xpub::from_str(xpub).map_err(|e| DiscoveryError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::new(xpub, base_path))
    }

    /// Derive the child at `index` below the base path
    pub fn derive(&self, index: u32) -> Result<DerivedAddress, DiscoveryError> {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|e| DiscoveryError::Derivation(e.to_string()))?;

        let derived = self
            .xpub
            .derive_pub(&self.secp, &[child])
            .map_err(|e| DiscoveryError::Derivation(e.to_string()))?;

        Ok(DerivedAddress {
            index,
            path: self.base_path.child(child),
            address: public_key_to_address(&derived.public_key),
        })
    }

    pub fn base_path(&self) -> &DerivationPath {
        &self.base_path
    }

    pub fn extended_public_key(&self) -> String {
        self.xpub.to_string()
    }
}

/// Assemble an extended public key from its raw parts
///
/// Parent fingerprint is unknown at this point and left zeroed; it does not
/// take part in child derivation.
pub fn xpub_from_parts(
    public_key_hex: &str,
    chain_code_hex: &str,
    path: &DerivationPath,
) -> Result<Xpub, DiscoveryError> {
    let key_bytes = hex::decode(public_key_hex.trim_start_matches("0x"))
        .map_err(|e| DiscoveryError::InvalidPublicKey(e.to_string()))?;
    let public_key = PublicKey::from_slice(&key_bytes)
        .map_err(|e| DiscoveryError::InvalidPublicKey(e.to_string()))?;

    let chain_code = hex::decode(chain_code_hex.trim_start_matches("0x"))
        .map_err(|e| DiscoveryError::InvalidPublicKey(e.to_string()))?;
    if chain_code.len() != 32 {
        return Err(DiscoveryError::InvalidPublicKey(format!(
            "chain code must be 32 bytes, got {}",
            chain_code.len()
        )));
    }

    let components: &[ChildNumber] = path.as_ref();
    let child_number = components.last().map(|c| u32::from(*c)).unwrap_or(0);

    let mut data = Vec::with_capacity(78);
    data.extend_from_slice(&XPUB_VERSION);
    data.push(components.len() as u8);
    data.extend_from_slice(&[0u8; 4]);
    data.extend_from_slice(&child_number.to_be_bytes());
    data.extend_from_slice(&chain_code);
    data.extend_from_slice(&public_key.serialize());

    Xpub::decode(&data).map_err(|e| DiscoveryError::InvalidPublicKey(e.to_string()))
}

pub fn path_to_address_n(path: &DerivationPath) -> Vec<u32> {
    let components: &[ChildNumber] = path.as_ref();
    components.iter().map(|c| u32::from(*c)).collect()
}

pub fn address_n_to_path(address_n: &[u32]) -> DerivationPath {
    DerivationPath::from(
        address_n
            .iter()
            .map(|n| ChildNumber::from(*n))
            .collect::<Vec<_>>(),
    )
}

/// Render a path as `m/44'/60'/0'/0/1`
pub fn format_path(path: &DerivationPath) -> String {
    let components: &[ChildNumber] = path.as_ref();
    let mut out = String::from("m");
    for child in components {
        match child {
            ChildNumber::Normal { index } => out.push_str(&format!("/{}", index)),
            ChildNumber::Hardened { index } => out.push_str(&format!("/{}'", index)),
        }
    }
    out
}
