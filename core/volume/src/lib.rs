//! Encrypted volume engine for SecureVault.
//!
//! This crate provides:
//! - The 512-byte volume header and its encrypted on-disk form
//! - `EncryptedVolume`, an open handle with sector-aligned encrypted I/O
//! - `VolumeManager`, a registry enforcing one handle per volume file
//! - Engine configuration and format constants

pub mod config;
pub mod header;
pub mod manager;
pub mod volume;

pub use config::{
    validate_volume_size, VolumeConfig, DEFAULT_IO_CHUNK_SIZE, DEFAULT_VOLUME_SIZE, HEADER_SIZE,
    MAGIC, MAX_VOLUME_SIZE, MIN_VOLUME_SIZE, VOLUME_EXTENSION, VOLUME_VERSION,
};
pub use header::{has_magic, PublicHeader, VolumeHeader};
pub use manager::{lock_volume, BasicVolumeInfo, VolumeHandle, VolumeManager};
pub use volume::{EncryptedVolume, VolumeInfo, VolumeState};
