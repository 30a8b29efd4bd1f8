//! Ethereum address encoding
//!
//! Addresses are the last 20 bytes of the Keccak-256 hash of the uncompressed
//! public key, rendered with the EIP-55 mixed-case checksum.

use bitcoin::secp256k1::PublicKey;
use sha3::{Digest, Keccak256};

use crate::error::DiscoveryError;

/// Computes the Keccak-256 hash of the provided data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let hash = hasher.finalize();
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

/// Checksummed address of a secp256k1 public key
pub fn public_key_to_address(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    checksum_hex(&hex::encode(&hash[12..]))
}

/// Normalize an address to its EIP-55 checksummed form
///
/// Accepts any casing, with or without the `0x` prefix.
pub fn to_checksum_address(address: &str) -> Result<String, DiscoveryError> {
    let stripped = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);

    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DiscoveryError::InvalidAddress(address.to_string()));
    }

    Ok(checksum_hex(&stripped.to_ascii_lowercase()))
}

fn checksum_hex(lower: &str) -> String {
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}
