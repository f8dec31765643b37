//! Hashing, message authentication, constant-time comparison and padding.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use securevault_common::{Error, Result};

/// AES block size in bytes; the default PKCS7 block size.
pub const AES_BLOCK_SIZE: usize = 16;

/// Length of a SHA-256 digest.
pub const SHA256_SIZE: usize = 32;

/// Length of a SHA-512 digest.
pub const SHA512_SIZE: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    Sha256::digest(data).into()
}

/// One-shot SHA-512.
pub fn sha512(data: &[u8]) -> [u8; SHA512_SIZE] {
    Sha512::digest(data).into()
}

/// HMAC-SHA-256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; SHA256_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Check an HMAC-SHA-256 tag in constant time.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

/// Compare two byte strings without an early exit on the first mismatch.
///
/// Differing lengths return `false` immediately; the length of a digest or
/// tag is not secret.
pub fn constant_time_equals(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

/// Apply PKCS7 padding for the given block size.
///
/// A full block of padding is appended when `data` is already aligned.
pub fn apply_padding(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    check_block_size(block_size)?;

    let padding = block_size - (data.len() % block_size);
    let mut padded = Vec::with_capacity(data.len() + padding);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding, padding as u8);
    Ok(padded)
}

/// Strip PKCS7 padding.
///
/// # Errors
/// - `InvalidPadding` if the trailing byte is outside `[1, block_size]` or
///   any padding byte disagrees with it. Usually a sign of a wrong key.
pub fn remove_padding(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    check_block_size(block_size)?;

    let Some(&last) = data.last() else {
        return Ok(Vec::new());
    };

    let padding = last as usize;
    if padding == 0 || padding > block_size || padding > data.len() {
        return Err(Error::InvalidPadding(format!(
            "Padding length {} out of range",
            padding
        )));
    }

    let (body, tail) = data.split_at(data.len() - padding);
    if tail.iter().any(|&b| b != last) {
        return Err(Error::InvalidPadding("Padding bytes mismatch".to_string()));
    }

    Ok(body.to_vec())
}

fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size > u8::MAX as usize {
        return Err(Error::InvalidInput(format!(
            "Invalid block size: {}",
            block_size
        )));
    }
    Ok(())
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode hex, tolerating spaces and dashes as separators.
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    let clean: String = text.chars().filter(|c| *c != ' ' && *c != '-').collect();
    hex::decode(clean).map_err(|e| Error::InvalidInput(format!("Invalid hex: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            to_hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha512_length_and_determinism() {
        let a = sha512(b"SecureVault");
        let b = sha512(b"SecureVault");
        assert_eq!(a.len(), SHA512_SIZE);
        assert_eq!(a, b);
        assert_ne!(a, sha512(b"SecureVaulT"));
    }

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            to_hex(&tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_hmac() {
        let key = b"mac-key";
        let tag = hmac_sha256(key, b"payload").unwrap();

        assert!(verify_hmac_sha256(key, b"payload", &tag).unwrap());
        assert!(!verify_hmac_sha256(key, b"payl0ad", &tag).unwrap());
        assert!(!verify_hmac_sha256(key, b"payload", &tag[..16]).unwrap());
    }

    #[test]
    fn test_constant_time_equals() {
        assert!(constant_time_equals(b"same", b"same"));
        assert!(!constant_time_equals(b"same", b"sane"));
        assert!(!constant_time_equals(b"short", b"longer"));
        assert!(constant_time_equals(b"", b""));
    }

    #[test]
    fn test_padding_roundtrip() {
        for len in 0..40 {
            let data = vec![0x5Au8; len];
            let padded = apply_padding(&data, AES_BLOCK_SIZE).unwrap();
            assert_eq!(padded.len() % AES_BLOCK_SIZE, 0);
            assert!(padded.len() > data.len());
            assert_eq!(remove_padding(&padded, AES_BLOCK_SIZE).unwrap(), data);
        }
    }

    #[test]
    fn test_padding_aligned_adds_full_block() {
        let padded = apply_padding(&[1u8; 16], AES_BLOCK_SIZE).unwrap();
        assert_eq!(padded.len(), 32);
        assert!(padded[16..].iter().all(|&b| b == 16));
    }

    #[test]
    fn test_remove_padding_rejects_garbage() {
        let mut zero_tail = vec![7u8; 16];
        zero_tail[15] = 0;
        assert!(matches!(
            remove_padding(&zero_tail, AES_BLOCK_SIZE),
            Err(Error::InvalidPadding(_))
        ));

        let mut too_long = vec![0u8; 16];
        too_long[15] = 17;
        assert!(matches!(
            remove_padding(&too_long, AES_BLOCK_SIZE),
            Err(Error::InvalidPadding(_))
        ));

        let mut mismatch = vec![4u8; 16];
        mismatch[13] = 3;
        assert!(matches!(
            remove_padding(&mismatch, AES_BLOCK_SIZE),
            Err(Error::InvalidPadding(_))
        ));
    }

    #[test]
    fn test_invalid_block_size() {
        assert!(apply_padding(b"x", 0).is_err());
        assert!(apply_padding(b"x", 256).is_err());
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(to_hex(&[0xDE, 0xAD, 0xBE, 0xEF]), "deadbeef");
        assert_eq!(from_hex("DE AD-be ef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(from_hex("abc").is_err());
    }
}
