//! Volume format constants and engine configuration.

use serde::{Deserialize, Serialize};

use securevault_common::{Error, Result};
use securevault_crypto::{CipherKind, KdfParams, SECTOR_SIZE};

/// Size of the header sector at the start of every volume file.
pub const HEADER_SIZE: usize = 512;

/// Format tag at offset 0 of every volume file.
pub const MAGIC: [u8; 4] = *b"SVLT";

/// Current header format version.
pub const VOLUME_VERSION: u32 = 1;

/// Smallest payload a volume may be created with (1 MiB).
pub const MIN_VOLUME_SIZE: u64 = 1024 * 1024;

/// Largest payload a volume may be created with (10 GiB).
pub const MAX_VOLUME_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Payload size used when the caller does not pick one (100 MiB).
pub const DEFAULT_VOLUME_SIZE: u64 = 100 * 1024 * 1024;

/// Conventional file extension for volume files.
pub const VOLUME_EXTENSION: &str = "svlt";

/// Default buffer size for streaming file contents in and out of a volume.
pub const DEFAULT_IO_CHUNK_SIZE: usize = 64 * 1024;

/// Largest accepted streaming buffer.
pub const MAX_IO_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Engine configuration.
///
/// Only affects newly created volumes and streaming buffers; an existing
/// volume always opens with the parameters recorded in its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Key derivation parameters for new volumes.
    pub kdf: KdfParams,
    /// Sector cipher for new volumes.
    pub cipher: CipherKind,
    /// Payload size used when none is given.
    pub default_volume_size: u64,
    /// Buffer size used when streaming file contents.
    pub io_chunk_size: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::standard(),
            cipher: CipherKind::default(),
            default_volume_size: DEFAULT_VOLUME_SIZE,
            io_chunk_size: DEFAULT_IO_CHUNK_SIZE,
        }
    }
}

impl VolumeConfig {
    /// Check every field against the engine limits.
    pub fn validate(&self) -> Result<()> {
        self.kdf.validate()?;
        validate_volume_size(self.default_volume_size)?;

        if self.io_chunk_size == 0
            || self.io_chunk_size % SECTOR_SIZE != 0
            || self.io_chunk_size > MAX_IO_CHUNK_SIZE
        {
            return Err(Error::InvalidInput(format!(
                "I/O chunk size {} must be a multiple of {} up to {}",
                self.io_chunk_size, SECTOR_SIZE, MAX_IO_CHUNK_SIZE
            )));
        }

        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Check a requested payload size.
///
/// The size must lie in `[MIN_VOLUME_SIZE, MAX_VOLUME_SIZE]` and be a whole
/// number of sectors.
pub fn validate_volume_size(size: u64) -> Result<()> {
    if !(MIN_VOLUME_SIZE..=MAX_VOLUME_SIZE).contains(&size) {
        return Err(Error::Volume(format!(
            "Volume size {} outside [{}, {}]",
            size, MIN_VOLUME_SIZE, MAX_VOLUME_SIZE
        )));
    }
    if size % SECTOR_SIZE as u64 != 0 {
        return Err(Error::Volume(format!(
            "Volume size {} is not a multiple of {}",
            size, SECTOR_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VolumeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cipher, CipherKind::AesXts);
        assert_eq!(config.kdf.iterations, 100_000);
    }

    #[test]
    fn test_volume_size_limits() {
        assert!(validate_volume_size(MIN_VOLUME_SIZE).is_ok());
        assert!(validate_volume_size(MAX_VOLUME_SIZE).is_ok());
        assert!(validate_volume_size(MIN_VOLUME_SIZE - SECTOR_SIZE as u64).is_err());
        assert!(validate_volume_size(MAX_VOLUME_SIZE + SECTOR_SIZE as u64).is_err());
        assert!(validate_volume_size(MIN_VOLUME_SIZE + 1).is_err());
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut config = VolumeConfig::default();
        config.io_chunk_size = 1000;
        assert!(config.validate().is_err());

        config.io_chunk_size = 0;
        assert!(config.validate().is_err());

        config.io_chunk_size = SECTOR_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = VolumeConfig {
            kdf: KdfParams::hardened(),
            cipher: CipherKind::TweakedCbc,
            default_volume_size: 16 * 1024 * 1024,
            io_chunk_size: 4096,
        };

        let json = config.to_json().unwrap();
        assert!(json.contains("tweaked-cbc"));

        let restored = VolumeConfig::from_json(&json).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = VolumeConfig::from_json(r#"{ "kdf": { "iterations": 200000 } }"#).unwrap();
        assert_eq!(config.kdf.iterations, 200_000);
        assert_eq!(config.default_volume_size, DEFAULT_VOLUME_SIZE);
        assert_eq!(config.io_chunk_size, DEFAULT_IO_CHUNK_SIZE);
    }
}
