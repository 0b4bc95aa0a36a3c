//! Deterministic address derivation from the wallet root seed.
//!
//! Derivation is a pure function of (seed, path): the same path always
//! yields the same address, and the source holds no mutable state, so it
//! is safe to call from any thread. This independence is what lets the
//! integrity verifier re-derive addresses locally and catch a server
//! substituting its own.

use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Indices at or above this bound belong to the hardened derivation space
/// and are never issued for receive/change addresses.
pub const HARDENED_BOUND: u32 = 1 << 31;

/// Receive chain of an account.
pub const CHANGE_EXTERNAL: u32 = 0;
/// Internal (change) chain of an account.
pub const CHANGE_INTERNAL: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerivationError {
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),
}

/// A BIP44-style derivation path. Immutable once constructed; ordering is
/// index-based within a fixed (purpose, coin_type, account, change) quadruple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DerivationPath {
    pub purpose: u32,
    pub coin_type: u32,
    pub account: u32,
    pub change: u32,
    pub index: u32,
}

impl DerivationPath {
    pub fn new(purpose: u32, coin_type: u32, account: u32, change: u32, index: u32) -> Self {
        Self { purpose, coin_type, account, change, index }
    }

    /// Validates the non-hardened leaf constraints.
    pub fn validate(&self) -> Result<(), DerivationError> {
        if self.index >= HARDENED_BOUND {
            return Err(DerivationError::InvalidPath(format!(
                "index {} is in the hardened space", self.index
            )));
        }
        if self.change != CHANGE_EXTERNAL && self.change != CHANGE_INTERNAL {
            return Err(DerivationError::InvalidPath(format!(
                "change chain must be 0 or 1, got {}", self.change
            )));
        }
        Ok(())
    }

    /// Canonical byte encoding used as hashing input and as storage keys.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..4].copy_from_slice(&self.purpose.to_le_bytes());
        out[4..8].copy_from_slice(&self.coin_type.to_le_bytes());
        out[8..12].copy_from_slice(&self.account.to_le_bytes());
        out[12..16].copy_from_slice(&self.change.to_le_bytes());
        out[16..20].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}

impl std::fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'/{}/{}",
            self.purpose, self.coin_type, self.account, self.change, self.index
        )
    }
}

/// An address produced deterministically at a derivation path. Never mutated
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub path: DerivationPath,
    pub address: String,
    pub public_key: String,
}

/// Pure derivation source over a read-only root seed.
pub struct KeySource {
    seed: [u8; 32],
}

impl KeySource {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Derives the public key bytes at `path`. Domain-separated so address
    /// and key material can never collide with other uses of the seed.
    fn derive_public_key_bytes(&self, path: &DerivationPath) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key("paylink-pubkey-v1");
        hasher.update(&self.seed);
        hasher.update(&path.to_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Derive the address and public key at `path`.
    pub fn derive_address(&self, path: &DerivationPath) -> Result<DerivedAddress, DerivationError> {
        path.validate()?;
        let pk = self.derive_public_key_bytes(path);
        let address = *blake3::Hasher::new_derive_key("paylink-address-v1")
            .update(&pk)
            .finalize()
            .as_bytes();
        Ok(DerivedAddress {
            path: *path,
            address: hex::encode(address),
            public_key: hex::encode(pk),
        })
    }

    /// Batch derivation; fails on the first invalid path.
    pub fn derive_addresses(
        &self,
        paths: &[DerivationPath],
    ) -> Result<Vec<DerivedAddress>, DerivationError> {
        paths.iter().map(|p| self.derive_address(p)).collect()
    }
}
