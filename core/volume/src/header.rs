//! The 512-byte volume header.
//!
//! # Sector layout
//!
//! ```text
//! [0x000, 0x040)  prelude, cleartext:
//!                 magic(4) version(4) salt(32) cipher(4) iterations(4) zero(16)
//! [0x040, 0x200)  sector cipher (index 0) over bytes [0, 448) of the
//!                 serialized header
//! ```
//!
//! The serialized header holds, big-endian and in this order:
//! magic(4) version(4) salt(32) volume_id(32) created_at(8) volume_size(8)
//! data_offset(8) cipher(4) iterations(4) checksum(32), then zero padding.
//! The checksum is SHA-256 over every byte before it.
//!
//! Magic, version and salt sit at the same offsets in the prelude and in the
//! serialized header, so the salt can be read before any key exists. The
//! prelude is re-checked against the decrypted copy, which makes every bit of
//! the sector tamper-evident.

use std::ops::Range;
use zeroize::{Zeroize, Zeroizing};

use crate::config::{HEADER_SIZE, MAGIC, VOLUME_VERSION};
use securevault_common::{now_millis, Error, Result};
use securevault_crypto::primitives::{constant_time_equals, sha256, SHA256_SIZE};
use securevault_crypto::{
    CipherKind, Salt, SectorCipher, VolumeId, HEADER_SECTOR, SALT_SIZE, VOLUME_ID_SIZE,
};

/// Cleartext bytes at the start of the header sector.
pub const PRELUDE_SIZE: usize = 64;

/// Encrypted bytes following the prelude.
const SEALED_SIZE: usize = HEADER_SIZE - PRELUDE_SIZE;

const MAGIC_RANGE: Range<usize> = 0..4;
const VERSION: Range<usize> = 4..8;
const SALT: Range<usize> = 8..40;

const VOLUME_ID: Range<usize> = 40..72;
const CREATED_AT: Range<usize> = 72..80;
const VOLUME_SIZE: Range<usize> = 80..88;
const DATA_OFFSET: Range<usize> = 88..96;
const CIPHER: Range<usize> = 96..100;
const ITERATIONS: Range<usize> = 100..104;
const CHECKSUM: Range<usize> = 104..136;

const PRELUDE_CIPHER: Range<usize> = 40..44;
const PRELUDE_ITERATIONS: Range<usize> = 44..48;
const PRELUDE_PADDING: Range<usize> = 48..PRELUDE_SIZE;

/// Check whether a buffer starts with the volume magic.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[MAGIC_RANGE] == MAGIC
}

/// Header fields readable without a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHeader {
    pub version: u32,
    pub salt: Salt,
    pub cipher_id: u32,
    pub iterations: u32,
}

impl PublicHeader {
    /// Parse the cleartext prelude of a raw header sector.
    ///
    /// # Errors
    /// - `InvalidHeader` if the buffer is short, the magic does not match or
    ///   the prelude padding is not zero
    pub fn parse(sector: &[u8]) -> Result<Self> {
        check_len(sector)?;
        if !has_magic(sector) {
            return Err(Error::InvalidHeader("Bad magic".to_string()));
        }
        if sector[PRELUDE_PADDING].iter().any(|&b| b != 0) {
            return Err(Error::InvalidHeader(
                "Reserved prelude bytes are not zero".to_string(),
            ));
        }

        Ok(Self {
            version: be_u32(sector, VERSION),
            salt: Salt::from_bytes(array::<SALT_SIZE>(sector, SALT)),
            cipher_id: be_u32(sector, PRELUDE_CIPHER),
            iterations: be_u32(sector, PRELUDE_ITERATIONS),
        })
    }

    fn write(&self, out: &mut [u8]) {
        out[MAGIC_RANGE].copy_from_slice(&MAGIC);
        out[VERSION].copy_from_slice(&self.version.to_be_bytes());
        out[SALT].copy_from_slice(self.salt.as_bytes());
        out[PRELUDE_CIPHER].copy_from_slice(&self.cipher_id.to_be_bytes());
        out[PRELUDE_ITERATIONS].copy_from_slice(&self.iterations.to_be_bytes());
        out[PRELUDE_PADDING].fill(0);
    }
}

/// Decoded volume header.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
pub struct VolumeHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Key derivation salt, fixed at creation.
    pub salt: Salt,
    /// Random identifier, fixed at creation.
    pub volume_id: VolumeId,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    /// Payload size in bytes, header excluded.
    pub volume_size: u64,
    /// File offset of the payload region.
    pub data_offset: u64,
    pub cipher_id: u32,
    /// PBKDF2 iteration count for this volume.
    pub iterations: u32,
    /// SHA-256 over the preceding fields.
    pub checksum: [u8; SHA256_SIZE],
}

impl VolumeHeader {
    /// Build a sealed header for a new volume.
    ///
    /// Generates a fresh volume id and stamps the current time.
    pub fn new(volume_size: u64, salt: Salt, cipher: CipherKind, iterations: u32) -> Self {
        let mut header = Self {
            magic: MAGIC,
            version: VOLUME_VERSION,
            salt,
            volume_id: VolumeId::generate(),
            created_at: now_millis(),
            volume_size,
            data_offset: HEADER_SIZE as u64,
            cipher_id: cipher.id(),
            iterations,
            checksum: [0u8; SHA256_SIZE],
        };
        header.seal();
        header
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Checksum of the current field values.
    pub fn compute_checksum(&self) -> [u8; SHA256_SIZE] {
        let bytes = self.to_bytes();
        sha256(&bytes[..CHECKSUM.start])
    }

    /// Whether the stored checksum matches the fields.
    pub fn verify_integrity(&self) -> bool {
        constant_time_equals(&self.compute_checksum(), &self.checksum)
    }

    /// Cipher named by the header, if known.
    pub fn cipher_kind(&self) -> Option<CipherKind> {
        CipherKind::from_id(self.cipher_id)
    }

    /// Fields mirrored in the cleartext prelude.
    pub fn public(&self) -> PublicHeader {
        PublicHeader {
            version: self.version,
            salt: self.salt.clone(),
            cipher_id: self.cipher_id,
            iterations: self.iterations,
        }
    }

    /// Serialize in canonical field order.
    ///
    /// Writes the stored checksum as-is; call [`VolumeHeader::seal`] after
    /// changing a field.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[MAGIC_RANGE].copy_from_slice(&self.magic);
        out[VERSION].copy_from_slice(&self.version.to_be_bytes());
        out[SALT].copy_from_slice(self.salt.as_bytes());
        out[VOLUME_ID].copy_from_slice(self.volume_id.as_bytes());
        out[CREATED_AT].copy_from_slice(&self.created_at.to_be_bytes());
        out[VOLUME_SIZE].copy_from_slice(&self.volume_size.to_be_bytes());
        out[DATA_OFFSET].copy_from_slice(&self.data_offset.to_be_bytes());
        out[CIPHER].copy_from_slice(&self.cipher_id.to_be_bytes());
        out[ITERATIONS].copy_from_slice(&self.iterations.to_be_bytes());
        out[CHECKSUM].copy_from_slice(&self.checksum);
        out
    }

    /// Parse a serialized header.
    ///
    /// # Errors
    /// - `InvalidHeader` if `bytes` is shorter than `HEADER_SIZE` or the
    ///   magic does not match
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes)?;
        if !has_magic(bytes) {
            return Err(Error::InvalidHeader("Bad magic".to_string()));
        }

        Ok(Self {
            magic: MAGIC,
            version: be_u32(bytes, VERSION),
            salt: Salt::from_bytes(array::<SALT_SIZE>(bytes, SALT)),
            volume_id: VolumeId::from_bytes(array::<VOLUME_ID_SIZE>(bytes, VOLUME_ID)),
            created_at: i64::from_be_bytes(array::<8>(bytes, CREATED_AT)),
            volume_size: be_u64(bytes, VOLUME_SIZE),
            data_offset: be_u64(bytes, DATA_OFFSET),
            cipher_id: be_u32(bytes, CIPHER),
            iterations: be_u32(bytes, ITERATIONS),
            checksum: array::<SHA256_SIZE>(bytes, CHECKSUM),
        })
    }

    /// Produce the on-disk header sector.
    pub fn encrypt(&self, cipher: &SectorCipher) -> Result<[u8; HEADER_SIZE]> {
        let mut sector = [0u8; HEADER_SIZE];
        self.public().write(&mut sector[..PRELUDE_SIZE]);

        let mut body = Zeroizing::new(self.to_bytes());
        cipher.encrypt_sector(&mut body[..SEALED_SIZE], HEADER_SECTOR)?;
        sector[PRELUDE_SIZE..].copy_from_slice(&body[..SEALED_SIZE]);

        Ok(sector)
    }

    /// Decrypt and fully verify an on-disk header sector.
    ///
    /// # Errors
    /// - `InvalidHeader` if the prelude is malformed, the decrypted bytes do
    ///   not parse, the reserved area is not zero, the prelude disagrees with
    ///   the decrypted fields, or the checksum does not match. A wrong key
    ///   lands in one of these.
    pub fn decrypt(sector: &[u8], cipher: &SectorCipher) -> Result<Self> {
        let public = PublicHeader::parse(sector)?;

        let mut body = Zeroizing::new([0u8; HEADER_SIZE]);
        body[..SEALED_SIZE].copy_from_slice(&sector[PRELUDE_SIZE..HEADER_SIZE]);
        cipher.decrypt_sector(&mut body[..SEALED_SIZE], HEADER_SECTOR)?;

        let header = Self::from_bytes(&body[..])?;

        if body[CHECKSUM.end..].iter().any(|&b| b != 0) {
            return Err(Error::InvalidHeader(
                "Reserved header bytes are not zero".to_string(),
            ));
        }
        if header.public() != public {
            return Err(Error::InvalidHeader(
                "Header prelude does not match".to_string(),
            ));
        }
        if !header.verify_integrity() {
            return Err(Error::InvalidHeader("Header checksum mismatch".to_string()));
        }

        Ok(header)
    }
}

fn check_len(bytes: &[u8]) -> Result<()> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::InvalidHeader(format!(
            "Header too short: {} bytes",
            bytes.len()
        )));
    }
    Ok(())
}

fn array<const N: usize>(bytes: &[u8], range: Range<usize>) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[range]);
    out
}

fn be_u32(bytes: &[u8], range: Range<usize>) -> u32 {
    u32::from_be_bytes(array::<4>(bytes, range))
}

fn be_u64(bytes: &[u8], range: Range<usize>) -> u64 {
    u64::from_be_bytes(array::<8>(bytes, range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use securevault_crypto::{VolumeKeys, KEY_LENGTH};

    fn test_keys() -> VolumeKeys {
        VolumeKeys::from_bytes([0x31u8; KEY_LENGTH], [0x32u8; KEY_LENGTH])
    }

    fn test_header(cipher: CipherKind) -> VolumeHeader {
        VolumeHeader::new(10 * 1024 * 1024, Salt::from_bytes([7u8; 32]), cipher, 100_000)
    }

    #[test]
    fn test_new_header_fields() {
        let header = test_header(CipherKind::AesXts);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VOLUME_VERSION);
        assert_eq!(header.data_offset, HEADER_SIZE as u64);
        assert_eq!(header.cipher_kind(), Some(CipherKind::AesXts));
        assert!(header.created_at > 0);
        assert!(header.verify_integrity());

        let other = test_header(CipherKind::AesXts);
        assert_ne!(header.volume_id, other.volume_id);
    }

    #[test]
    fn test_wire_layout() {
        let header = test_header(CipherKind::TweakedCbc);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], b"SVLT");
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        assert_eq!(&bytes[8..40], &[7u8; 32]);
        assert_eq!(&bytes[80..88], &(10u64 * 1024 * 1024).to_be_bytes());
        assert_eq!(&bytes[88..96], &512u64.to_be_bytes());
        assert_eq!(&bytes[96..100], &1u32.to_be_bytes());
        assert_eq!(&bytes[100..104], &100_000u32.to_be_bytes());
        assert_eq!(&bytes[104..136], &sha256(&bytes[..104]));
        assert!(bytes[136..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_bytes_rejects_short_and_bad_magic() {
        let bytes = test_header(CipherKind::AesXts).to_bytes();

        assert!(matches!(
            VolumeHeader::from_bytes(&bytes[..HEADER_SIZE - 1]),
            Err(Error::InvalidHeader(_))
        ));

        let mut bad = bytes;
        bad[0] = b'X';
        assert!(matches!(
            VolumeHeader::from_bytes(&bad),
            Err(Error::InvalidHeader(_))
        ));
        assert!(!has_magic(&bad));
        assert!(has_magic(&bytes));
    }

    #[test]
    fn test_to_bytes_keeps_stored_checksum() {
        let mut header = test_header(CipherKind::AesXts);
        header.volume_size += 512;

        let parsed = VolumeHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(!parsed.verify_integrity());

        header.seal();
        let parsed = VolumeHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(parsed.verify_integrity());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        for kind in [CipherKind::AesXts, CipherKind::TweakedCbc] {
            let cipher = SectorCipher::new(kind, &test_keys()).unwrap();
            let header = test_header(kind);

            let sector = header.encrypt(&cipher).unwrap();
            let public = PublicHeader::parse(&sector).unwrap();
            assert_eq!(public, header.public());

            // The volume id never appears in clear
            let id = header.volume_id.as_bytes();
            assert!(!sector.windows(id.len()).any(|w| w == id));

            let decrypted = VolumeHeader::decrypt(&sector, &cipher).unwrap();
            assert_eq!(decrypted, header);
        }
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let header = test_header(CipherKind::AesXts);
        let cipher = SectorCipher::new(CipherKind::AesXts, &test_keys()).unwrap();
        let sector = header.encrypt(&cipher).unwrap();

        let wrong_keys = VolumeKeys::from_bytes([0x31u8; KEY_LENGTH], [0x33u8; KEY_LENGTH]);
        let wrong = SectorCipher::new(CipherKind::AesXts, &wrong_keys).unwrap();
        assert!(matches!(
            VolumeHeader::decrypt(&sector, &wrong),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        for kind in [CipherKind::AesXts, CipherKind::TweakedCbc] {
            let cipher = SectorCipher::new(kind, &test_keys()).unwrap();
            let sector = test_header(kind).encrypt(&cipher).unwrap();

            for bit in 0..HEADER_SIZE * 8 {
                let mut tampered = sector;
                tampered[bit / 8] ^= 1 << (bit % 8);
                assert!(
                    VolumeHeader::decrypt(&tampered, &cipher).is_err(),
                    "{} bit {} flip went unnoticed",
                    kind,
                    bit
                );
            }
        }
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            salt in any::<[u8; 32]>(),
            id in any::<[u8; 32]>(),
            created_at in any::<i64>(),
            volume_size in any::<u64>(),
            cipher_id in any::<u32>(),
            iterations in any::<u32>(),
        ) {
            let mut header = VolumeHeader {
                magic: MAGIC,
                version: VOLUME_VERSION,
                salt: Salt::from_bytes(salt),
                volume_id: VolumeId::from_bytes(id),
                created_at,
                volume_size,
                data_offset: HEADER_SIZE as u64,
                cipher_id,
                iterations,
                checksum: [0u8; SHA256_SIZE],
            };
            header.seal();

            let parsed = VolumeHeader::from_bytes(&header.to_bytes()).unwrap();
            prop_assert!(parsed.verify_integrity());
            prop_assert_eq!(parsed, header);
        }
    }
}
