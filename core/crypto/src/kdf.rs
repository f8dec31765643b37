//! Key derivation using PBKDF2-HMAC-SHA512.
//!
//! One PBKDF2 run produces 512 bits of key material which is split into the
//! two independent 256-bit keys of a volume.

use hmac::Hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::keys::{Salt, VolumeKeys, KEY_LENGTH};
use securevault_common::{Error, Result};

/// Lowest iteration count accepted for key derivation.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Highest iteration count accepted; guards against hostile headers.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Iteration count used by new volumes.
pub const DEFAULT_ITERATIONS: u32 = MIN_ITERATIONS;

/// Iteration count of the hardened preset.
pub const HARDENED_ITERATIONS: u32 = 600_000;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// PBKDF2 iteration count.
    pub iterations: u32,
}

impl KdfParams {
    /// Default parameters, at the minimum safe floor.
    pub fn standard() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Parameters following current brute-force resistance guidance.
    ///
    /// Roughly six times slower than [`KdfParams::standard`].
    pub fn hardened() -> Self {
        Self {
            iterations: HARDENED_ITERATIONS,
        }
    }

    /// Check the iteration count against the accepted range.
    pub fn validate(&self) -> Result<()> {
        validate_iterations(self.iterations)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::standard()
    }
}

fn validate_iterations(iterations: u32) -> Result<()> {
    if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
        return Err(Error::InvalidInput(format!(
            "Iteration count {} outside [{}, {}]",
            iterations, MIN_ITERATIONS, MAX_ITERATIONS
        )));
    }
    Ok(())
}

/// Derive the volume key pair from a password and salt.
///
/// # Preconditions
/// - `password` must not be empty
/// - `iterations` must lie in `[MIN_ITERATIONS, MAX_ITERATIONS]`
///
/// # Postconditions
/// - Returns two independent 256-bit keys
/// - The result is deterministic given the same inputs
///
/// # Errors
/// - Returns error if password is empty or iterations are out of range
/// - Returns `KeyDerivation` if the PRF rejects its parameters
///
/// # Security
/// - Password is not stored or logged
/// - The combined 512-bit buffer is zeroized after splitting
pub fn derive_keys(password: &[u8], salt: &Salt, iterations: u32) -> Result<VolumeKeys> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    validate_iterations(iterations)?;

    let mut material = Zeroizing::new([0u8; KEY_LENGTH * 2]);
    pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt.as_bytes(), iterations, &mut material[..])
        .map_err(|e| Error::KeyDerivation(format!("PBKDF2 failed: {}", e)))?;

    let mut key1 = [0u8; KEY_LENGTH];
    let mut key2 = [0u8; KEY_LENGTH];
    key1.copy_from_slice(&material[..KEY_LENGTH]);
    key2.copy_from_slice(&material[KEY_LENGTH..]);

    let keys = VolumeKeys::from_bytes(key1, key2);
    key1.zeroize();
    key2.zeroize();
    Ok(keys)
}

/// Verify that a password produces the expected key pair.
///
/// Both keys are compared in constant time and the results combined
/// without short-circuiting.
pub fn verify_password(
    password: &[u8],
    salt: &Salt,
    expected: &VolumeKeys,
    iterations: u32,
) -> Result<bool> {
    let derived = derive_keys(password, salt, iterations)?;

    let equal = derived.key1()[..].ct_eq(&expected.key1()[..])
        & derived.key2()[..].ct_eq(&expected.key2()[..]);
    Ok(bool::from(equal))
}

/// Measure how long one derivation takes with the given iteration count.
///
/// Useful for picking an iteration count for the current machine.
pub fn benchmark_derivation(iterations: u32) -> Result<Duration> {
    let salt = Salt::generate();
    let start = Instant::now();
    derive_keys(b"benchmark-password", &salt, iterations)?;
    Ok(start.elapsed())
}
