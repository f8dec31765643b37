//! Cryptographic building blocks for SecureVault volumes.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA512
//! - Hashing, HMAC, constant-time comparison and PKCS7 padding
//! - Tweakable sector encryption (AES-256-XTS and the legacy tweaked CBC)
//! - Secure randomness for salts, identifiers and passwords
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod kdf;
pub mod keys;
pub mod primitives;
pub mod random;
pub mod sector;

pub use kdf::{benchmark_derivation, derive_keys, verify_password, KdfParams};
pub use keys::{Salt, VolumeId, VolumeKeys, KEY_LENGTH, SALT_SIZE, VOLUME_ID_SIZE};
pub use primitives::{constant_time_equals, sha256, sha512};
pub use random::{
    generate_bytes, generate_password, generate_salt, password_strength, validate_password,
    MIN_PASSWORD_LENGTH,
};
pub use sector::{CipherKind, SectorCipher, HEADER_SECTOR, SECTOR_SIZE};
