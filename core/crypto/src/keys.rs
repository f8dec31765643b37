//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of each encryption key in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of the key derivation salt in bytes.
pub const SALT_SIZE: usize = 32;

/// Length of a volume identifier in bytes.
pub const VOLUME_ID_SIZE: usize = 32;

/// The two independent keys protecting a volume.
///
/// `key1` drives the bulk block cipher, `key2` encrypts the per-sector
/// tweak. Both are derived together from the password and never stored.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeKeys {
    key1: [u8; KEY_LENGTH],
    key2: [u8; KEY_LENGTH],
}

impl VolumeKeys {
    /// Create a key pair from raw bytes.
    pub fn from_bytes(key1: [u8; KEY_LENGTH], key2: [u8; KEY_LENGTH]) -> Self {
        Self { key1, key2 }
    }

    /// Bulk cipher key.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn key1(&self) -> &[u8; KEY_LENGTH] {
        &self.key1
    }

    /// Tweak cipher key.
    pub fn key2(&self) -> &[u8; KEY_LENGTH] {
        &self.key2
    }

    /// Generate a random key pair.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut key1 = [0u8; KEY_LENGTH];
        let mut key2 = [0u8; KEY_LENGTH];
        rng.fill_bytes(&mut key1);
        rng.fill_bytes(&mut key2);
        Self { key1, key2 }
    }
}

impl fmt::Debug for VolumeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeKeys([REDACTED])")
    }
}

/// Salt for key derivation.
///
/// Generated once at volume creation and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct Salt(pub [u8; SALT_SIZE]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Random, immutable identifier of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
pub struct VolumeId(pub [u8; VOLUME_ID_SIZE]);

impl VolumeId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut id = [0u8; VOLUME_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; VOLUME_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the identifier bytes.
    pub fn as_bytes(&self) -> &[u8; VOLUME_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_keys_generate() {
        let a = VolumeKeys::generate();
        let b = VolumeKeys::generate();

        assert_ne!(a.key1(), b.key1());
        // The two halves are independent
        assert_ne!(a.key1(), a.key2());
    }

    #[test]
    fn test_volume_keys_debug_redacted() {
        let keys = VolumeKeys::from_bytes([7u8; KEY_LENGTH], [9u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", keys), "VolumeKeys([REDACTED])");
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        // Random salts should be different
        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_volume_id_hex() {
        let id = VolumeId::from_bytes([0xABu8; VOLUME_ID_SIZE]);
        assert_eq!(id.to_hex(), "ab".repeat(VOLUME_ID_SIZE));
        assert_eq!(id.to_string(), id.to_hex());
    }
}
