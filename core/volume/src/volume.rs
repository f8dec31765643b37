//! Encrypted volume handle.
//!
//! A volume file is a header sector followed by the payload region. The
//! handle owns the file descriptor and the expanded sector keys; payload
//! bytes are only ever written encrypted, one sector-aligned span per call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{validate_volume_size, VolumeConfig, HEADER_SIZE, VOLUME_VERSION};
use crate::header::{PublicHeader, VolumeHeader};
use securevault_common::{timestamp_to_datetime, Error, Result};
use securevault_crypto::{derive_keys, CipherKind, Salt, SectorCipher, SECTOR_SIZE};

/// Lifecycle state of a volume handle.
///
/// `create` and `open` only return once the handle is active; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// Keys are loaded and payload I/O is allowed.
    Active,
    /// Keys have been wiped and the file closed.
    Closed,
}

/// Summary of an open volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub path: PathBuf,
    /// Hex rendering of the volume identifier.
    pub volume_id: String,
    pub created_at: DateTime<Utc>,
    /// Payload size in bytes.
    pub size: u64,
    pub cipher: String,
    pub iterations: u32,
}

/// Open handle on an encrypted volume file.
///
/// Not internally synchronized: share it behind a lock (the volume manager
/// hands out `Arc<Mutex<EncryptedVolume>>`).
pub struct EncryptedVolume {
    path: PathBuf,
    file: Option<File>,
    header: VolumeHeader,
    cipher: Option<SectorCipher>,
    state: VolumeState,
}

impl EncryptedVolume {
    /// Create a volume file with default settings.
    pub fn create(path: impl AsRef<Path>, password: &[u8], size: u64) -> Result<Self> {
        Self::create_with_config(path, password, size, &VolumeConfig::default())
    }

    /// Create a new volume file and return an active handle.
    ///
    /// # Preconditions
    /// - `size` lies in `[MIN_VOLUME_SIZE, MAX_VOLUME_SIZE]` and is a whole
    ///   number of sectors
    /// - `password` must not be empty
    /// - nothing exists at `path` yet
    ///
    /// # Postconditions
    /// - The file holds the encrypted header followed by `size` payload bytes
    /// - The returned handle is active
    ///
    /// # Errors
    /// - `Volume` on an invalid size or any failure while writing; a
    ///   partially written file is removed before returning
    pub fn create_with_config(
        path: impl AsRef<Path>,
        password: &[u8],
        size: u64,
        config: &VolumeConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        validate_volume_size(size)?;
        config.kdf.validate()?;
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }

        debug!(path = %path.display(), size, cipher = %config.cipher, "Creating volume");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::Volume(format!("Failed to create volume file: {}", e)))?;

        match Self::initialize(path, file, password, size, config) {
            Ok(volume) => {
                info!(path = %path.display(), size, "Volume created");
                Ok(volume)
            }
            Err(e) => {
                warn!(path = %path.display(), "Volume creation failed, removing partial file");
                if let Err(remove_err) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %remove_err, "Failed to remove partial volume");
                }
                Err(Error::Volume(format!("Failed to create volume: {}", e)))
            }
        }
    }

    fn initialize(
        path: &Path,
        mut file: File,
        password: &[u8],
        size: u64,
        config: &VolumeConfig,
    ) -> Result<Self> {
        let salt = Salt::generate();
        let keys = derive_keys(password, &salt, config.kdf.iterations)?;
        let cipher = SectorCipher::new(config.cipher, &keys)?;
        drop(keys);

        let header = VolumeHeader::new(size, salt, config.cipher, config.kdf.iterations);
        let sector = header.encrypt(&cipher)?;

        file.write_all(&sector)?;
        file.set_len(header.data_offset + size)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            header,
            cipher: Some(cipher),
            state: VolumeState::Active,
        })
    }

    /// Open an existing volume with a password.
    ///
    /// # Errors
    /// - `Volume("wrong password or corrupt volume")` for every failure:
    ///   wrong password, tampered or truncated file, unknown format and I/O
    ///   errors are deliberately indistinguishable
    pub fn open(path: impl AsRef<Path>, password: &[u8]) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Opening volume");

        match Self::unlock(path, password) {
            Ok(volume) => {
                info!(path = %path.display(), size = volume.header.volume_size, "Volume opened");
                Ok(volume)
            }
            Err(_) => {
                warn!(path = %path.display(), "Volume unlock failed");
                Err(Error::auth_failure())
            }
        }
    }

    fn unlock(path: &Path, password: &[u8]) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut sector = [0u8; HEADER_SIZE];
        file.read_exact(&mut sector)?;

        let public = PublicHeader::parse(&sector)?;
        if public.version != VOLUME_VERSION {
            return Err(Error::InvalidHeader(format!(
                "Unsupported version {}",
                public.version
            )));
        }
        let kind = CipherKind::from_id(public.cipher_id)
            .ok_or_else(|| Error::InvalidHeader(format!("Unknown cipher {}", public.cipher_id)))?;

        let keys = derive_keys(password, &public.salt, public.iterations)?;
        let cipher = SectorCipher::new(kind, &keys)?;
        drop(keys);

        let header = VolumeHeader::decrypt(&sector, &cipher)?;

        if header.data_offset != HEADER_SIZE as u64
            || header.volume_size == 0
            || header.volume_size % SECTOR_SIZE as u64 != 0
        {
            return Err(Error::InvalidHeader("Invalid payload geometry".to_string()));
        }
        let end = header
            .data_offset
            .checked_add(header.volume_size)
            .ok_or_else(|| Error::InvalidHeader("Payload size overflow".to_string()))?;
        if file.metadata()?.len() < end {
            return Err(Error::InvalidHeader("Volume file is truncated".to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            header,
            cipher: Some(cipher),
            state: VolumeState::Active,
        })
    }

    /// Read `length` payload bytes starting at `offset`.
    ///
    /// # Errors
    /// - `VolumeClosed` after [`EncryptedVolume::close`]
    /// - `OutOfBounds` if `offset + length` exceeds the payload size; the
    ///   file is not touched
    pub fn read_data(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let span = self.span(offset, length)?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let file_offset = self.header.data_offset + span.start;
        let (file, cipher) = self.parts()?;

        let mut buf = Zeroizing::new(vec![0u8; span.len]);
        file.seek(SeekFrom::Start(file_offset))?;
        file.read_exact(&mut buf)?;
        cipher.decrypt_stream(&mut buf, span.first_sector())?;

        Ok(buf[span.lead..span.lead + length].to_vec())
    }

    /// Write `data` into the payload starting at `offset`.
    ///
    /// Partial edge sectors are read, decrypted and merged before the whole
    /// span is re-encrypted and written back.
    ///
    /// # Errors
    /// - `VolumeClosed` after [`EncryptedVolume::close`]
    /// - `OutOfBounds` if the range exceeds the payload size; the file is not
    ///   touched
    pub fn write_data(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let span = self.span(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let file_offset = self.header.data_offset + span.start;
        let (file, cipher) = self.parts()?;

        let mut buf = Zeroizing::new(vec![0u8; span.len]);
        if span.lead != 0 || span.len != data.len() {
            file.seek(SeekFrom::Start(file_offset))?;
            file.read_exact(&mut buf)?;
            cipher.decrypt_stream(&mut buf, span.first_sector())?;
        }
        buf[span.lead..span.lead + data.len()].copy_from_slice(data);

        cipher.encrypt_stream(&mut buf, span.first_sector())?;
        file.seek(SeekFrom::Start(file_offset))?;
        file.write_all(&buf)?;

        Ok(())
    }

    /// Flush written data to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        let (file, _) = self.parts()?;
        file.sync_all()?;
        Ok(())
    }

    /// Close the volume.
    ///
    /// Syncs, closes the file, wipes the keys and scrubs the header. Calling
    /// it again is a no-op. Key material is wiped even if the final sync
    /// fails; the sync error is still returned.
    pub fn close(&mut self) -> Result<()> {
        if self.state == VolumeState::Closed {
            return Ok(());
        }

        let synced = match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        };
        self.cipher = None;
        self.header.zeroize();
        self.state = VolumeState::Closed;

        info!(path = %self.path.display(), "Volume closed");
        synced.map_err(Error::from)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VolumeState {
        self.state
    }

    /// Whether payload I/O is still allowed.
    pub fn is_open(&self) -> bool {
        self.state == VolumeState::Active
    }

    /// Path the volume was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Usable payload size in bytes; zero once closed.
    pub fn available_size(&self) -> u64 {
        self.header.volume_size
    }

    /// Decrypted header of the open volume.
    pub fn header(&self) -> Result<&VolumeHeader> {
        self.ensure_open()?;
        Ok(&self.header)
    }

    /// Summary of the open volume.
    pub fn info(&self) -> Result<VolumeInfo> {
        self.ensure_open()?;

        let cipher = self
            .header
            .cipher_kind()
            .map(|kind| kind.name().to_string())
            .unwrap_or_else(|| format!("unknown ({})", self.header.cipher_id));

        Ok(VolumeInfo {
            path: self.path.clone(),
            volume_id: self.header.volume_id.to_hex(),
            created_at: timestamp_to_datetime(self.header.created_at),
            size: self.header.volume_size,
            cipher,
            iterations: self.header.iterations,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            VolumeState::Active => Ok(()),
            VolumeState::Closed => Err(Error::VolumeClosed),
        }
    }

    fn parts(&mut self) -> Result<(&mut File, &SectorCipher)> {
        match (self.file.as_mut(), self.cipher.as_ref()) {
            (Some(file), Some(cipher)) => Ok((file, cipher)),
            _ => Err(Error::VolumeClosed),
        }
    }

    /// Validate a request and widen it to whole sectors.
    fn span(&self, offset: u64, length: usize) -> Result<SectorSpan> {
        self.ensure_open()?;

        let size = self.header.volume_size;
        let out_of_bounds = || Error::OutOfBounds {
            offset,
            length: length as u64,
            size,
        };

        let end = offset
            .checked_add(length as u64)
            .ok_or_else(out_of_bounds)?;
        if end > size {
            return Err(out_of_bounds());
        }

        SectorSpan::covering(offset, end)
    }
}

impl Drop for EncryptedVolume {
    fn drop(&mut self) {
        if self.state == VolumeState::Active {
            debug!(path = %self.path.display(), "Volume dropped while open, closing");
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to close volume on drop");
            }
        }
    }
}

impl std::fmt::Debug for EncryptedVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedVolume")
            .field("path", &self.path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A payload range rounded out to sector boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectorSpan {
    /// Aligned payload offset of the first covering sector.
    start: u64,
    /// Bytes covered, a multiple of `SECTOR_SIZE`.
    len: usize,
    /// Position of the requested range inside the span.
    lead: usize,
}

impl SectorSpan {
    fn covering(offset: u64, end: u64) -> Result<Self> {
        let sector = SECTOR_SIZE as u64;
        let start = offset - offset % sector;
        let aligned_end = end.div_ceil(sector) * sector;

        let len = usize::try_from(aligned_end - start)
            .map_err(|_| Error::InvalidInput("Request too large".to_string()))?;

        Ok(Self {
            start,
            len,
            lead: (offset - start) as usize,
        })
    }

    /// Cipher index of the first sector; index 0 is the header.
    fn first_sector(&self) -> u64 {
        self.start / SECTOR_SIZE as u64 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_VOLUME_SIZE;
    use securevault_common::AUTH_FAILURE;
    use tempfile::TempDir;

    const PASSWORD: &[u8] = b"correct horse battery staple";

    fn new_volume(dir: &TempDir) -> (PathBuf, EncryptedVolume) {
        let path = dir.path().join("test.svlt");
        let volume = EncryptedVolume::create(&path, PASSWORD, MIN_VOLUME_SIZE).unwrap();
        (path, volume)
    }

    #[test]
    fn test_sector_span() {
        let span = SectorSpan::covering(0, 512).unwrap();
        assert_eq!((span.start, span.len, span.lead), (0, 512, 0));
        assert_eq!(span.first_sector(), 1);

        let span = SectorSpan::covering(700, 1100).unwrap();
        assert_eq!((span.start, span.len, span.lead), (512, 1024, 188));
        assert_eq!(span.first_sector(), 2);

        let span = SectorSpan::covering(1024, 1025).unwrap();
        assert_eq!((span.start, span.len, span.lead), (1024, 512, 0));
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let (path, mut volume) = new_volume(&dir);

        assert!(volume.is_open());
        assert_eq!(volume.available_size(), MIN_VOLUME_SIZE);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            HEADER_SIZE as u64 + MIN_VOLUME_SIZE
        );

        let info = volume.info().unwrap();
        volume.write_data(4096, b"persisted").unwrap();
        volume.close().unwrap();

        let mut reopened = EncryptedVolume::open(&path, PASSWORD).unwrap();
        assert_eq!(reopened.info().unwrap(), info);
        assert_eq!(reopened.read_data(4096, 9).unwrap(), b"persisted");
    }

    #[test]
    fn test_read_write_unaligned() {
        let dir = TempDir::new().unwrap();
        let (_, mut volume) = new_volume(&dir);

        let aligned: Vec<u8> = (0..2048).map(|i| i as u8).collect();
        volume.write_data(0, &aligned).unwrap();

        // Straddles three sectors and leaves the neighbours intact
        let patch = vec![0xEEu8; 600];
        volume.write_data(300, &patch).unwrap();

        let all = volume.read_data(0, 2048).unwrap();
        assert_eq!(&all[..300], &aligned[..300]);
        assert_eq!(&all[300..900], &patch[..]);
        assert_eq!(&all[900..], &aligned[900..]);

        assert_eq!(volume.read_data(301, 1).unwrap(), vec![0xEE]);
        assert!(volume.read_data(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_payload_is_encrypted_on_disk() {
        let dir = TempDir::new().unwrap();
        let (path, mut volume) = new_volume(&dir);

        let marker = b"plaintext-marker-plaintext-marker";
        volume.write_data(0, marker).unwrap();
        volume.sync().unwrap();

        let raw = fs::read(&path).unwrap();
        assert!(!raw.windows(marker.len()).any(|w| w == marker));
    }

    #[test]
    fn test_bounds_checked() {
        let dir = TempDir::new().unwrap();
        let (path, mut volume) = new_volume(&dir);
        let size = volume.available_size();

        assert!(volume.read_data(size - 4, 4).is_ok());

        let err = volume.read_data(size - 4, 5).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        assert!(err.to_string().contains("out of bounds"));

        let before = fs::read(&path).unwrap();
        assert!(matches!(
            volume.write_data(size, b"x"),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            volume.write_data(size - 2, b"spill"),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(matches!(
            volume.read_data(u64::MAX, 2),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_drop_closes_active_volume() {
        let dir = TempDir::new().unwrap();
        let (path, mut volume) = new_volume(&dir);
        volume.write_data(4096, b"written before drop").unwrap();
        drop(volume);

        let mut reopened = EncryptedVolume::open(&path, PASSWORD).unwrap();
        assert_eq!(reopened.read_data(4096, 19).unwrap(), b"written before drop");
    }

    #[test]
    fn test_wrong_password() {
        let dir = TempDir::new().unwrap();
        let (path, volume) = new_volume(&dir);
        drop(volume);

        let err = EncryptedVolume::open(&path, b"not the password").unwrap_err();
        assert!(err.is_volume_error());
        assert!(err.to_string().contains(AUTH_FAILURE));
    }

    #[test]
    fn test_tampered_and_truncated_are_opaque() {
        let dir = TempDir::new().unwrap();
        let (path, volume) = new_volume(&dir);
        drop(volume);
        let original = fs::read(&path).unwrap();

        for bit in [3usize, 40 * 8 + 1, 100 * 8, 300 * 8 + 5, 511 * 8 + 7] {
            let mut tampered = original.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            fs::write(&path, &tampered).unwrap();

            let err = EncryptedVolume::open(&path, PASSWORD).unwrap_err();
            assert_eq!(err.to_string(), Error::auth_failure().to_string());
        }

        fs::write(&path, &original[..HEADER_SIZE + 1024]).unwrap();
        let err = EncryptedVolume::open(&path, PASSWORD).unwrap_err();
        assert_eq!(err.to_string(), Error::auth_failure().to_string());

        let missing = dir.path().join("missing.svlt");
        let err = EncryptedVolume::open(&missing, PASSWORD).unwrap_err();
        assert_eq!(err.to_string(), Error::auth_failure().to_string());
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let dir = TempDir::new().unwrap();
        let (_, mut volume) = new_volume(&dir);

        volume.close().unwrap();
        volume.close().unwrap();

        assert_eq!(volume.state(), VolumeState::Closed);
        assert_eq!(volume.available_size(), 0);
        assert!(matches!(volume.read_data(0, 1), Err(Error::VolumeClosed)));
        assert!(matches!(volume.write_data(0, b"x"), Err(Error::VolumeClosed)));
        assert!(volume.info().is_err());

        let err = volume.read_data(0, 1).unwrap_err();
        assert!(err.to_string().contains("volume is closed"));
    }

    #[test]
    fn test_create_rejects_bad_size_without_touching_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.svlt");

        let err = EncryptedVolume::create(&path, PASSWORD, 4096).unwrap_err();
        assert!(matches!(err, Error::Volume(_)));
        assert!(!path.exists());

        let err = EncryptedVolume::create(&path, PASSWORD, MIN_VOLUME_SIZE + 100).unwrap_err();
        assert!(matches!(err, Error::Volume(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_create_does_not_clobber_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("existing.svlt");
        fs::write(&path, b"keep me").unwrap();

        let err = EncryptedVolume::create(&path, PASSWORD, MIN_VOLUME_SIZE).unwrap_err();
        assert!(matches!(err, Error::Volume(_)));
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_legacy_cipher_volume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.svlt");
        let config = VolumeConfig {
            cipher: CipherKind::TweakedCbc,
            ..VolumeConfig::default()
        };

        let mut volume =
            EncryptedVolume::create_with_config(&path, PASSWORD, MIN_VOLUME_SIZE, &config).unwrap();
        volume.write_data(1000, b"legacy data").unwrap();
        drop(volume);

        let mut reopened = EncryptedVolume::open(&path, PASSWORD).unwrap();
        assert_eq!(reopened.info().unwrap().cipher, "AES-256-CBC-TWEAK");
        assert_eq!(reopened.read_data(1000, 11).unwrap(), b"legacy data");
    }
}
