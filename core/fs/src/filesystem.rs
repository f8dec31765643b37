//! Named files stored inside an encrypted volume.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::catalog::{Catalog, FileEntry, CATALOG_SIZE};
use securevault_common::{Error, Result};
use securevault_volume::{EncryptedVolume, VolumeConfig, VolumeInfo, DEFAULT_IO_CHUNK_SIZE};

/// File system view over an open volume.
///
/// Borrows the volume for its whole lifetime; the catalog is kept in memory
/// and rewritten in full after every mutation.
pub struct VolumeFileSystem<'v> {
    volume: &'v mut EncryptedVolume,
    catalog: Catalog,
    chunk_size: usize,
}

impl<'v> VolumeFileSystem<'v> {
    /// Load the catalog of `volume`.
    ///
    /// An unreadable catalog, such as the never-written region of a fresh
    /// volume, is treated as empty.
    ///
    /// # Errors
    /// - Returns error if the volume is closed or the catalog region cannot
    ///   be read at all
    pub fn load(volume: &'v mut EncryptedVolume) -> Result<Self> {
        Self::load_with_chunk_size(volume, DEFAULT_IO_CHUNK_SIZE)
    }

    /// Load using the streaming buffer size from `config`.
    pub fn load_with_config(volume: &'v mut EncryptedVolume, config: &VolumeConfig) -> Result<Self> {
        Self::load_with_chunk_size(volume, config.io_chunk_size)
    }

    fn load_with_chunk_size(volume: &'v mut EncryptedVolume, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidInput("I/O chunk size cannot be zero".to_string()));
        }

        let region = Zeroizing::new(volume.read_data(0, CATALOG_SIZE)?);
        let catalog = match Catalog::decode(&region, volume.available_size()) {
            Ok(catalog) => catalog,
            Err(e) => {
                debug!(error = %e, "No valid catalog, starting empty");
                Catalog::new()
            }
        };

        debug!(files = catalog.len(), "Catalog loaded");
        Ok(Self {
            volume,
            catalog,
            chunk_size,
        })
    }

    /// Erase the file table.
    ///
    /// File contents are left in place but become unreachable.
    pub fn format(&mut self) -> Result<()> {
        self.catalog.clear();
        self.save_catalog()?;
        info!("Volume formatted");
        Ok(())
    }

    /// Copy a file from the host file system into the volume.
    pub fn add_file(&mut self, source: impl AsRef<Path>, name: &str) -> Result<FileEntry> {
        self.add_file_with_progress(source, name, |_| {})
    }

    /// Like [`Self::add_file`], reporting the bytes stored so far after
    /// every chunk.
    pub fn add_file_with_progress<P: FnMut(u64)>(
        &mut self,
        source: impl AsRef<Path>,
        name: &str,
        progress: P,
    ) -> Result<FileEntry> {
        let source = source.as_ref();
        let file = File::open(source)?;
        let size = file.metadata()?.len();
        self.add_reader_with_progress(name, file, size, progress)
    }

    /// Store an in-memory buffer as a file.
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<FileEntry> {
        self.add_reader(name, data, data.len() as u64)
    }

    /// Store exactly `size` bytes from `reader` as a file.
    pub fn add_reader<R: Read>(&mut self, name: &str, reader: R, size: u64) -> Result<FileEntry> {
        self.add_reader_with_progress(name, reader, size, |_| {})
    }

    /// Store exactly `size` bytes from `reader`, calling `progress` with the
    /// running byte count after each chunk is written.
    ///
    /// # Postconditions
    /// - The catalog holds a new entry for `name` and has been persisted
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid name
    /// - `AlreadyExists` if `name` is taken
    /// - `TooManyFiles` if the catalog is full
    /// - `NoSpace` if no free extent holds `size` bytes
    /// - `Io` if `reader` ends early; bytes already written stay unreferenced
    pub fn add_reader_with_progress<R: Read, P: FnMut(u64)>(
        &mut self,
        name: &str,
        mut reader: R,
        size: u64,
        mut progress: P,
    ) -> Result<FileEntry> {
        self.catalog.check_insert(name)?;

        let offset = self
            .catalog
            .allocate(size, self.volume.available_size())
            .ok_or_else(|| Error::NoSpace {
                required: size,
                available: self.free_space(),
            })?;

        debug!(name, size, offset, "Adding file");

        let mut buf = Zeroizing::new(vec![0u8; self.chunk_size]);
        let mut written = 0u64;
        while written < size {
            let n = chunk_len(size - written, self.chunk_size);
            reader.read_exact(&mut buf[..n])?;
            self.volume.write_data(offset + written, &buf[..n])?;
            written += n as u64;
            progress(written);
        }

        let entry = FileEntry::new(name, size, offset);
        self.catalog.insert(entry.clone())?;
        if let Err(e) = self.save_catalog() {
            self.catalog.remove(name);
            return Err(e);
        }

        info!(name, size, "File added");
        Ok(entry)
    }

    /// Copy a stored file out to the host file system.
    ///
    /// A partially written destination is removed on failure.
    pub fn extract_file(&mut self, name: &str, destination: impl AsRef<Path>) -> Result<u64> {
        self.extract_file_with_progress(name, destination, |_| {})
    }

    /// Like [`Self::extract_file`], reporting the bytes copied so far after
    /// every chunk.
    pub fn extract_file_with_progress<P: FnMut(u64)>(
        &mut self,
        name: &str,
        destination: impl AsRef<Path>,
        mut progress: P,
    ) -> Result<u64> {
        let destination = destination.as_ref();
        let entry = self.entry(name)?;

        let mut out = File::create(destination)?;
        let result = self
            .copy_out(&entry, &mut out, &mut progress)
            .and_then(|n| out.sync_all().map(|_| n).map_err(Error::from));

        if result.is_err() {
            drop(out);
            if let Err(e) = fs::remove_file(destination) {
                warn!(path = %destination.display(), error = %e, "Failed to remove partial output");
            }
        }
        result
    }

    /// Stream a stored file into `writer`.
    pub fn extract_to<W: Write>(&mut self, name: &str, mut writer: W) -> Result<u64> {
        let entry = self.entry(name)?;
        self.copy_out(&entry, &mut writer, &mut |_| {})
    }

    /// Read a stored file into memory.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(name)?;
        let len = usize::try_from(entry.size)
            .map_err(|_| Error::InvalidInput(format!("File '{}' too large for memory", name)))?;

        let mut out = Vec::with_capacity(len);
        self.copy_out(&entry, &mut out, &mut |_| {})?;
        Ok(out)
    }

    /// Remove a file from the catalog.
    ///
    /// Its extent becomes available to later allocations.
    pub fn delete_file(&mut self, name: &str) -> Result<FileEntry> {
        let index = self
            .catalog
            .position(name)
            .ok_or_else(|| Error::NotFound(format!("File '{}' not found", name)))?;
        let entry = self.catalog.entries()[index].clone();
        self.catalog.remove(name);

        if let Err(e) = self.save_catalog() {
            // Keep memory consistent with disk
            self.catalog.insert_at(index, entry)?;
            return Err(e);
        }

        info!(name, "File deleted");
        Ok(entry)
    }

    /// All stored files in insertion order.
    pub fn list_files(&self) -> &[FileEntry] {
        self.catalog.entries()
    }

    /// Summary of the underlying volume.
    pub fn volume_info(&self) -> Result<VolumeInfo> {
        self.volume.info()
    }

    pub fn file_info(&self, name: &str) -> Option<&FileEntry> {
        self.catalog.find(name)
    }

    /// Bytes taken by file contents plus the catalog region.
    pub fn used_space(&self) -> u64 {
        self.catalog.used_bytes() + CATALOG_SIZE as u64
    }

    /// Payload bytes not taken by files or the catalog.
    pub fn free_space(&self) -> u64 {
        self.volume.available_size().saturating_sub(self.used_space())
    }

    fn entry(&self, name: &str) -> Result<FileEntry> {
        self.catalog
            .find(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("File '{}' not found", name)))
    }

    fn copy_out<W: Write>(
        &mut self,
        entry: &FileEntry,
        writer: &mut W,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let mut copied = 0u64;
        while copied < entry.size {
            let n = chunk_len(entry.size - copied, self.chunk_size);
            let chunk = Zeroizing::new(self.volume.read_data(entry.offset + copied, n)?);
            writer.write_all(&chunk)?;
            copied += n as u64;
            progress(copied);
        }
        writer.flush()?;
        Ok(copied)
    }

    fn save_catalog(&mut self) -> Result<()> {
        let region = Zeroizing::new(self.catalog.encode()?);
        self.volume.write_data(0, &region)?;
        self.volume.sync()
    }
}

fn chunk_len(remaining: u64, chunk_size: usize) -> usize {
    usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size))
}
