use core::fmt;

use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::TrellisError;

/// Width of a full SHA-256 digest.
pub const HASH_LENGTH: usize = 32;
/// Width of a truncated digest as used for addressing and dedup keys.
pub const ADDRESS_LENGTH: usize = 16;

/// Incremental SHA-256 over several byte regions. Every hash in the stack
/// is produced either through this builder or the one-shot constructors
/// below, so the digest algorithm has a single home.
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(mut self, data: &[u8]) -> Self {
        self.0.update(data);
        self
    }

    pub fn finish(self) -> Hash {
        Hash(self.0.finalize().into())
    }

    /// Finishes and truncates in one step, for the common case where only
    /// the 16-byte form is needed.
    pub fn finish_address(self) -> AddressHash {
        self.finish().truncated()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Full-width SHA-256 digest.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    pub fn of(data: &[u8]) -> Self {
        Hasher::new().update(data).finish()
    }

    pub const fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, TrellisError> {
        if data.len() < HASH_LENGTH {
            return Err(TrellisError::HashMismatch);
        }
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&data[..HASH_LENGTH]);
        Ok(Self(bytes))
    }

    /// The truncated form used on the wire.
    pub fn truncated(&self) -> AddressHash {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&self.0[..ADDRESS_LENGTH]);
        AddressHash(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_LENGTH] {
        self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Truncated digest: destination addresses, packet hashes, link and
/// resource ids are all this shape.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct AddressHash([u8; ADDRESS_LENGTH]);

impl AddressHash {
    /// Truncated digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Hasher::new().update(data).finish_address()
    }

    pub const fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; ADDRESS_LENGTH])
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, TrellisError> {
        if data.len() < ADDRESS_LENGTH {
            return Err(TrellisError::HashMismatch);
        }
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&data[..ADDRESS_LENGTH]);
        Ok(Self(bytes))
    }

    pub fn random<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut seed = [0u8; ADDRESS_LENGTH];
        rng.fill_bytes(&mut seed);
        Self::of(&seed)
    }

    pub fn from_hex(hex_string: &str) -> Result<Self, TrellisError> {
        let bytes = hex::decode(hex_string.trim()).map_err(|_| TrellisError::HashMismatch)?;
        Self::try_from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        hash.truncated()
    }
}

impl Default for AddressHash {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(self.0))
    }
}
