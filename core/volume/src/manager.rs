//! Registry of open volumes.
//!
//! Guarantees at most one handle per volume file within a process. A path is
//! reserved before key derivation starts, so a concurrent second `open` or
//! `create` on the same path fails immediately instead of waiting on the
//! first one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::config::{VolumeConfig, MAGIC};
use crate::header::has_magic;
use crate::volume::EncryptedVolume;
use securevault_common::{Error, Result};

/// Shared handle on an open volume.
pub type VolumeHandle = Arc<Mutex<EncryptedVolume>>;

/// Unauthenticated file metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicVolumeInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
}

enum Slot {
    /// Key derivation or file creation in progress.
    Pending,
    Open(VolumeHandle),
    /// Unregistered but the handle may still be in use until `close` returns.
    Closing,
}

/// Registry mapping volume paths to open handles.
///
/// Instantiate one per process (or per test); it holds no global state.
pub struct VolumeManager {
    config: VolumeConfig,
    volumes: Mutex<HashMap<PathBuf, Slot>>,
}

impl VolumeManager {
    /// Create a manager with the default configuration.
    pub fn new() -> Self {
        Self::with_config(VolumeConfig::default())
    }

    /// Create a manager using `config` for new volumes.
    pub fn with_config(config: VolumeConfig) -> Self {
        Self {
            config,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Configuration applied to new volumes.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Create a volume and register its handle.
    ///
    /// # Errors
    /// - `AlreadyOpen` if the path is open or being opened
    /// - Any error from [`EncryptedVolume::create_with_config`]
    pub fn create_volume(
        &self,
        path: impl AsRef<Path>,
        password: &[u8],
        size: u64,
    ) -> Result<VolumeHandle> {
        self.create_volume_with_config(path, password, size, &self.config)
    }

    /// Create a volume with settings other than the manager's own.
    pub fn create_volume_with_config(
        &self,
        path: impl AsRef<Path>,
        password: &[u8],
        size: u64,
        config: &VolumeConfig,
    ) -> Result<VolumeHandle> {
        let key = registry_key(path.as_ref())?;
        let reservation = self.reserve(&key)?;

        let volume = EncryptedVolume::create_with_config(&key, password, size, config)?;
        Ok(reservation.commit(volume))
    }

    /// Open a volume and register its handle.
    ///
    /// # Errors
    /// - `AlreadyOpen` if the path is open or being opened
    /// - The opaque unlock failure from [`EncryptedVolume::open`]
    pub fn open_volume(&self, path: impl AsRef<Path>, password: &[u8]) -> Result<VolumeHandle> {
        let key = registry_key(path.as_ref())?;
        let reservation = self.reserve(&key)?;

        let volume = EncryptedVolume::open(&key, password)?;
        Ok(reservation.commit(volume))
    }

    /// Close a registered volume and drop it from the registry.
    ///
    /// Other clones of the handle observe a closed volume afterwards. The
    /// path stays reserved until the close completes, so a concurrent open
    /// fails with `AlreadyOpen` while another thread still holds the handle.
    ///
    /// # Errors
    /// - `NotOpen` if no open handle is registered for the path
    pub fn close_volume(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = registry_key(path.as_ref())?;

        let handle = {
            let mut slots = self.slots();
            match slots.get_mut(&key).and_then(begin_close) {
                Some(handle) => handle,
                None => return Err(Error::NotOpen(key.display().to_string())),
            }
        };

        let result = lock_volume(&handle).close();
        self.slots().remove(&key);
        debug!(path = %key.display(), "Volume unregistered");
        result
    }

    /// Handle of an open volume, if any.
    pub fn get_volume(&self, path: impl AsRef<Path>) -> Option<VolumeHandle> {
        let key = registry_key(path.as_ref()).ok()?;
        match self.slots().get(&key) {
            Some(Slot::Open(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Whether an open handle is registered for the path.
    pub fn is_volume_open(&self, path: impl AsRef<Path>) -> bool {
        self.get_volume(path).is_some()
    }

    /// Paths of all open volumes.
    pub fn open_volumes(&self) -> Vec<PathBuf> {
        self.slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Close every open volume.
    ///
    /// Intended for process shutdown. Every volume is closed even if one
    /// fails; the first error is returned.
    pub fn close_all_volumes(&self) -> Result<()> {
        let handles: Vec<(PathBuf, VolumeHandle)> = {
            let mut slots = self.slots();
            slots
                .iter_mut()
                .filter_map(|(path, slot)| begin_close(slot).map(|handle| (path.clone(), handle)))
                .collect()
        };

        let mut first_error = None;
        for (path, handle) in handles {
            if let Err(e) = lock_volume(&handle).close() {
                warn!(path = %path.display(), error = %e, "Failed to close volume");
                first_error.get_or_insert(e);
            }
            self.slots().remove(&path);
        }

        info!("All volumes closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Whether the file starts with the volume magic.
    ///
    /// Needs no password and says nothing about integrity.
    pub fn is_valid_volume(&self, path: impl AsRef<Path>) -> bool {
        let mut magic = [0u8; MAGIC.len()];
        File::open(path.as_ref())
            .and_then(|mut file| file.read_exact(&mut magic))
            .map(|_| has_magic(&magic))
            .unwrap_or(false)
    }

    /// File size and modification time, without unlocking.
    pub fn get_volume_info(&self, path: impl AsRef<Path>) -> Result<BasicVolumeInfo> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;

        Ok(BasicVolumeInfo {
            path: path.to_path_buf(),
            file_size: metadata.len(),
            last_modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.volumes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, key: &Path) -> Result<Reservation<'_>> {
        let mut slots = self.slots();
        if slots.contains_key(key) {
            return Err(Error::AlreadyOpen(key.display().to_string()));
        }
        slots.insert(key.to_path_buf(), Slot::Pending);

        Ok(Reservation {
            manager: self,
            key: key.to_path_buf(),
            committed: false,
        })
    }
}

impl Default for VolumeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending registry slot, released on drop unless committed.
struct Reservation<'a> {
    manager: &'a VolumeManager,
    key: PathBuf,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, volume: EncryptedVolume) -> VolumeHandle {
        let handle = Arc::new(Mutex::new(volume));
        self.manager
            .slots()
            .insert(self.key.clone(), Slot::Open(Arc::clone(&handle)));
        self.committed = true;
        handle
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.manager.slots().remove(&self.key);
        }
    }
}

/// Move an open slot to `Closing`, yielding its handle; other slots are left as is.
fn begin_close(slot: &mut Slot) -> Option<VolumeHandle> {
    match std::mem::replace(slot, Slot::Closing) {
        Slot::Open(handle) => Some(handle),
        other => {
            *slot = other;
            None
        }
    }
}

/// Lock a volume handle, recovering from a poisoned lock.
pub fn lock_volume(handle: &VolumeHandle) -> MutexGuard<'_, EncryptedVolume> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Absolute, symlink-free registry key for a path that may not exist yet.
fn registry_key(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(key) => Ok(key),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let name = path
                .file_name()
                .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))?;
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            Ok(parent.canonicalize()?.join(name))
        }
        Err(e) => Err(e.into()),
    }
}
