//! Tweakable sector encryption.
//!
//! A volume is encrypted in fixed-size sectors, each keyed by its index so
//! that identical plaintext in two sectors never yields identical
//! ciphertext. Two constructions are available and selected per volume by
//! the header's cipher identifier:
//!
//! - [`CipherKind::AesXts`]: IEEE P1619 AES-256-XTS. Used for new volumes.
//! - [`CipherKind::TweakedCbc`]: the original SecureVault construction.
//!   `key2` encrypts a tweak block holding the little-endian sector index;
//!   the result is XORed into every plaintext block, the data is encrypted
//!   with AES-256-CBC under `key1` using the sector index as IV, and the
//!   tweak is XORed in again. It has no ciphertext stealing and a
//!   predictable IV, so it is kept only to read and write volumes that
//!   were created with it.
//!
//! Neither construction authenticates data. Sector index 0 belongs to the
//! volume header; payload sector indices start at 1.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit};
use serde::{Deserialize, Serialize};
use std::fmt;
use xts_mode::{get_tweak_default, Xts128};
use zeroize::{Zeroize, Zeroizing};

use crate::keys::VolumeKeys;
use crate::primitives::AES_BLOCK_SIZE;
use securevault_common::{Error, Result};

/// Size of one encryption sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector index reserved for the volume header.
pub const HEADER_SECTOR: u64 = 0;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Sector cipher construction, identified on disk by a numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    /// Tweak-XOR around AES-256-CBC (identifier 1).
    TweakedCbc,
    /// AES-256-XTS (identifier 2).
    AesXts,
}

impl CipherKind {
    /// Numeric identifier stored in the volume header.
    pub fn id(self) -> u32 {
        match self {
            CipherKind::TweakedCbc => 1,
            CipherKind::AesXts => 2,
        }
    }

    /// Resolve a header identifier.
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(CipherKind::TweakedCbc),
            2 => Some(CipherKind::AesXts),
            _ => None,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            CipherKind::TweakedCbc => "AES-256-CBC-TWEAK",
            CipherKind::AesXts => "AES-256-XTS",
        }
    }
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::AesXts
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Engine {
    Xts(Xts128<Aes256>),
    TweakedCbc { bulk: Aes256, tweak: Aes256 },
}

/// Sector cipher bound to a volume's key pair.
///
/// Holds the expanded AES key schedules; they are wiped when the cipher is
/// dropped.
pub struct SectorCipher {
    kind: CipherKind,
    engine: Engine,
}

impl SectorCipher {
    /// Build a cipher of the given kind from the volume keys.
    ///
    /// # Errors
    /// - Returns error if the AES key schedule cannot be initialized
    pub fn new(kind: CipherKind, keys: &VolumeKeys) -> Result<Self> {
        let bulk = new_aes(keys.key1())?;
        let tweak = new_aes(keys.key2())?;

        let engine = match kind {
            CipherKind::AesXts => Engine::Xts(Xts128::new(bulk, tweak)),
            CipherKind::TweakedCbc => Engine::TweakedCbc { bulk, tweak },
        };

        Ok(Self { kind, engine })
    }

    /// Construction in use.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt one sector in place.
    ///
    /// # Preconditions
    /// - `sector.len()` is a non-zero multiple of the AES block size
    ///
    /// # Errors
    /// - Returns error if the sector length is invalid
    pub fn encrypt_sector(&self, sector: &mut [u8], sector_index: u64) -> Result<()> {
        check_sector_len(sector.len())?;

        match &self.engine {
            Engine::Xts(xts) => {
                xts.encrypt_sector(sector, get_tweak_default(sector_index as u128));
                Ok(())
            }
            Engine::TweakedCbc { bulk, tweak } => {
                let mask = encrypted_tweak(tweak, sector_index);
                xor_each_block(sector, &mask);

                let iv = index_block(sector_index);
                let len = sector.len();
                Aes256CbcEnc::inner_iv_init(bulk.clone(), &iv)
                    .encrypt_padded_mut::<NoPadding>(sector, len)
                    .map_err(|e| Error::Crypto(format!("Sector encryption failed: {}", e)))?;

                xor_each_block(sector, &mask);
                Ok(())
            }
        }
    }

    /// Decrypt one sector in place.
    ///
    /// # Preconditions
    /// - `sector.len()` is a non-zero multiple of the AES block size
    ///
    /// # Errors
    /// - Returns error if the sector length is invalid
    pub fn decrypt_sector(&self, sector: &mut [u8], sector_index: u64) -> Result<()> {
        check_sector_len(sector.len())?;

        match &self.engine {
            Engine::Xts(xts) => {
                xts.decrypt_sector(sector, get_tweak_default(sector_index as u128));
                Ok(())
            }
            Engine::TweakedCbc { bulk, tweak } => {
                let mask = encrypted_tweak(tweak, sector_index);
                xor_each_block(sector, &mask);

                let iv = index_block(sector_index);
                Aes256CbcDec::inner_iv_init(bulk.clone(), &iv)
                    .decrypt_padded_mut::<NoPadding>(sector)
                    .map_err(|e| Error::Crypto(format!("Sector decryption failed: {}", e)))?;

                xor_each_block(sector, &mask);
                Ok(())
            }
        }
    }

    /// Encrypt a buffer sector by sector, in place.
    ///
    /// The buffer is split into `SECTOR_SIZE` chunks (the last one may be
    /// shorter) encrypted with indices `start_sector`, `start_sector + 1`, ...
    ///
    /// # Errors
    /// - Returns error if the buffer is empty or not block-aligned
    /// - Returns error if the sector index would overflow
    pub fn encrypt_stream(&self, data: &mut [u8], start_sector: u64) -> Result<()> {
        self.process_stream(data, start_sector, Self::encrypt_sector)
    }

    /// Decrypt a buffer produced by [`SectorCipher::encrypt_stream`], in place.
    pub fn decrypt_stream(&self, data: &mut [u8], start_sector: u64) -> Result<()> {
        self.process_stream(data, start_sector, Self::decrypt_sector)
    }

    fn process_stream(
        &self,
        data: &mut [u8],
        start_sector: u64,
        op: fn(&Self, &mut [u8], u64) -> Result<()>,
    ) -> Result<()> {
        check_sector_len(data.len())?;

        let sectors = data.len().div_ceil(SECTOR_SIZE) as u64;
        start_sector
            .checked_add(sectors - 1)
            .ok_or_else(|| Error::InvalidInput("Sector index overflow".to_string()))?;

        for (i, chunk) in data.chunks_mut(SECTOR_SIZE).enumerate() {
            op(self, chunk, start_sector + i as u64)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SectorCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorCipher({}, [REDACTED])", self.kind)
    }
}

/// Encrypt a copy of `data` starting at `start_sector`.
pub fn encrypt_stream(
    kind: CipherKind,
    keys: &VolumeKeys,
    data: &[u8],
    start_sector: u64,
) -> Result<Vec<u8>> {
    let cipher = SectorCipher::new(kind, keys)?;
    let mut out = data.to_vec();
    cipher.encrypt_stream(&mut out, start_sector)?;
    Ok(out)
}

/// Decrypt a copy of `data` starting at `start_sector`.
pub fn decrypt_stream(
    kind: CipherKind,
    keys: &VolumeKeys,
    data: &[u8],
    start_sector: u64,
) -> Result<Vec<u8>> {
    let cipher = SectorCipher::new(kind, keys)?;
    let mut out = data.to_vec();
    cipher.decrypt_stream(&mut out, start_sector)?;
    Ok(out)
}

fn new_aes(key: &[u8]) -> Result<Aes256> {
    Aes256::new_from_slice(key).map_err(|e| Error::Crypto(format!("Invalid AES key: {}", e)))
}

fn check_sector_len(len: usize) -> Result<()> {
    if len == 0 || len % AES_BLOCK_SIZE != 0 {
        return Err(Error::InvalidInput(format!(
            "Sector data length {} is not a non-zero multiple of {}",
            len, AES_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// 16-byte block holding the little-endian sector index, upper half zero.
fn index_block(sector_index: u64) -> Block {
    let mut block = Block::default();
    block[..8].copy_from_slice(&sector_index.to_le_bytes());
    block
}

fn encrypted_tweak(tweak_cipher: &Aes256, sector_index: u64) -> Zeroizing<[u8; AES_BLOCK_SIZE]> {
    let mut block = index_block(sector_index);
    tweak_cipher.encrypt_block(&mut block);

    let mut mask = Zeroizing::new([0u8; AES_BLOCK_SIZE]);
    mask.copy_from_slice(&block);
    block.as_mut_slice().zeroize();
    mask
}

fn xor_each_block(data: &mut [u8], mask: &[u8; AES_BLOCK_SIZE]) {
    for block in data.chunks_mut(AES_BLOCK_SIZE) {
        for (byte, m) in block.iter_mut().zip(mask) {
            *byte ^= m;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;
    use proptest::prelude::*;

    fn test_keys() -> VolumeKeys {
        VolumeKeys::from_bytes([0x11u8; KEY_LENGTH], [0x22u8; KEY_LENGTH])
    }

    const KINDS: [CipherKind; 2] = [CipherKind::AesXts, CipherKind::TweakedCbc];

    #[test]
    fn test_cipher_ids() {
        for kind in KINDS {
            assert_eq!(CipherKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(CipherKind::from_id(0), None);
        assert_eq!(CipherKind::default(), CipherKind::AesXts);
    }

    #[test]
    fn test_sector_roundtrip() {
        for kind in KINDS {
            let cipher = SectorCipher::new(kind, &test_keys()).unwrap();
            let plaintext: Vec<u8> = (0..SECTOR_SIZE).map(|i| i as u8).collect();

            let mut buf = plaintext.clone();
            cipher.encrypt_sector(&mut buf, 7).unwrap();
            assert_ne!(buf, plaintext);

            cipher.decrypt_sector(&mut buf, 7).unwrap();
            assert_eq!(buf, plaintext);
        }
    }

    #[test]
    fn test_identical_sectors_differ_by_position() {
        for kind in KINDS {
            let cipher = SectorCipher::new(kind, &test_keys()).unwrap();
            let mut data = vec![0u8; SECTOR_SIZE * 2];
            cipher.encrypt_stream(&mut data, 1).unwrap();

            assert_ne!(data[..SECTOR_SIZE], data[SECTOR_SIZE..]);
        }
    }

    #[test]
    fn test_wrong_sector_index_garbles() {
        for kind in KINDS {
            let cipher = SectorCipher::new(kind, &test_keys()).unwrap();
            let plaintext = vec![0x42u8; SECTOR_SIZE];

            let mut buf = plaintext.clone();
            cipher.encrypt_sector(&mut buf, 3).unwrap();
            cipher.decrypt_sector(&mut buf, 4).unwrap();
            assert_ne!(buf, plaintext);
        }
    }

    #[test]
    fn test_wrong_key_garbles() {
        let other = VolumeKeys::from_bytes([0x11u8; KEY_LENGTH], [0x23u8; KEY_LENGTH]);
        for kind in KINDS {
            let plaintext = vec![0x42u8; SECTOR_SIZE];
            let ciphertext = encrypt_stream(kind, &test_keys(), &plaintext, 1).unwrap();
            let garbled = decrypt_stream(kind, &other, &ciphertext, 1).unwrap();
            assert_ne!(garbled, plaintext);
        }
    }

    #[test]
    fn test_constructions_differ() {
        let plaintext = vec![0u8; SECTOR_SIZE];
        let xts = encrypt_stream(CipherKind::AesXts, &test_keys(), &plaintext, 1).unwrap();
        let cbc = encrypt_stream(CipherKind::TweakedCbc, &test_keys(), &plaintext, 1).unwrap();
        assert_ne!(xts, cbc);
    }

    #[test]
    fn test_stream_matches_per_sector() {
        for kind in KINDS {
            let cipher = SectorCipher::new(kind, &test_keys()).unwrap();
            let plaintext: Vec<u8> = (0..SECTOR_SIZE * 3).map(|i| (i * 7) as u8).collect();

            let mut streamed = plaintext.clone();
            cipher.encrypt_stream(&mut streamed, 10).unwrap();

            let mut manual = plaintext.clone();
            for (i, chunk) in manual.chunks_mut(SECTOR_SIZE).enumerate() {
                cipher.encrypt_sector(chunk, 10 + i as u64).unwrap();
            }
            assert_eq!(streamed, manual);
        }
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        let cipher = SectorCipher::new(CipherKind::AesXts, &test_keys()).unwrap();
        assert!(cipher.encrypt_sector(&mut [], 1).is_err());
        assert!(cipher.encrypt_sector(&mut [0u8; 15], 1).is_err());
        assert!(cipher.encrypt_stream(&mut [0u8; 520], 1).is_err());
    }

    #[test]
    fn test_sector_index_overflow() {
        let cipher = SectorCipher::new(CipherKind::AesXts, &test_keys()).unwrap();
        let mut data = vec![0u8; SECTOR_SIZE * 2];
        assert!(cipher.encrypt_stream(&mut data, u64::MAX).is_err());
    }

    proptest! {
        #[test]
        fn prop_stream_roundtrip(
            blocks in 1usize..96,
            seed in any::<u8>(),
            start in 0u64..(u64::MAX / 2),
            cbc in any::<bool>(),
        ) {
            let kind = if cbc { CipherKind::TweakedCbc } else { CipherKind::AesXts };
            let plaintext: Vec<u8> = (0..blocks * AES_BLOCK_SIZE)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();

            let ciphertext = encrypt_stream(kind, &test_keys(), &plaintext, start).unwrap();
            prop_assert_eq!(ciphertext.len(), plaintext.len());

            let decrypted = decrypt_stream(kind, &test_keys(), &ciphertext, start).unwrap();
            prop_assert_eq!(decrypted, plaintext);
        }
    }
}
