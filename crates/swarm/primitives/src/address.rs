//! Swarm overlay addresses.

use core::fmt;
use core::str::FromStr;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::HASH_SIZE;

/// A 32-byte address in the Swarm overlay.
///
/// Chunks and nodes share the same address space, which is what makes
/// proximity between a chunk and a node meaningful.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwarmAddress(pub B256);

/// Address of a chunk (content hash or single-owner id).
pub type ChunkAddress = SwarmAddress;

/// Address of a node in the overlay.
pub type OverlayAddress = SwarmAddress;

impl SwarmAddress {
    /// The all-zero address.
    pub const ZERO: Self = Self(B256::ZERO);

    /// Wraps raw bytes.
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(B256::new(bytes))
    }

    /// Copies an address from a slice, returning `None` on a length mismatch.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HASH_SIZE]>::try_from(bytes).ok().map(Self::new)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0.0
    }

    /// Returns true for the all-zero address.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<B256> for SwarmAddress {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl From<[u8; HASH_SIZE]> for SwarmAddress {
    fn from(value: [u8; HASH_SIZE]) -> Self {
        Self::new(value)
    }
}

impl AsRef<[u8]> for SwarmAddress {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl FromStr for SwarmAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)?;
        Ok(Self::new(bytes))
    }
}

impl fmt::Display for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwarmAddress({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let addr = SwarmAddress::new([0xab; HASH_SIZE]);
        let parsed: SwarmAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);

        let prefixed: SwarmAddress = format!("0x{addr}").parse().unwrap();
        assert_eq!(prefixed, addr);
    }

    #[test]
    fn test_try_from_slice_rejects_wrong_length() {
        assert!(SwarmAddress::try_from_slice(&[0u8; 31]).is_none());
        assert!(SwarmAddress::try_from_slice(&[0u8; 32]).is_some());
    }
}
