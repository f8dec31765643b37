//! File table stored at the start of a volume's payload.
//!
//! The catalog occupies a fixed 64 KiB region at payload offset 0 and is
//! always rewritten whole. Wire format, big-endian:
//!
//! ```text
//! count(4) then per entry: name_len(4) name(UTF-8) size(8) offset(8) created_at(8)
//! ```
//!
//! followed by zero padding up to `CATALOG_SIZE`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use securevault_common::{now_millis, timestamp_to_datetime, Error, Result};
use securevault_crypto::SECTOR_SIZE;

/// Size of the catalog region in bytes.
pub const CATALOG_SIZE: usize = 64 * 1024;

/// Payload offset where file data begins.
pub const DATA_START: u64 = CATALOG_SIZE as u64;

/// Maximum number of entries in a volume.
pub const MAX_FILES: usize = 512;

/// Maximum file name length in bytes.
pub const MAX_FILENAME_LENGTH: usize = 256;

const COUNT_LEN: usize = 4;
const FIXED_ENTRY_LEN: usize = 4 + 8 + 8 + 8;

/// A stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Name, unique within the volume.
    pub name: String,
    /// Length in bytes.
    pub size: u64,
    /// Payload offset of the first byte.
    pub offset: u64,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
}

impl FileEntry {
    /// Create an entry stamped with the current time.
    pub fn new(name: impl Into<String>, size: u64, offset: u64) -> Self {
        Self {
            name: name.into(),
            size,
            offset,
            created_at: now_millis(),
        }
    }

    /// Payload offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Creation time as a UTC timestamp.
    pub fn created(&self) -> DateTime<Utc> {
        timestamp_to_datetime(self.created_at)
    }

    fn encoded_len(&self) -> usize {
        FIXED_ENTRY_LEN + self.name.len()
    }
}

/// Check a file name against the catalog rules.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("File name cannot be empty".to_string()));
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(Error::InvalidInput(format!(
            "File name is {} bytes, limit is {}",
            name.len(),
            MAX_FILENAME_LENGTH
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidInput(
            "File name cannot contain NUL".to_string(),
        ));
    }
    Ok(())
}

/// In-memory file table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<FileEntry>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by name.
    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Check that an entry named `name` could be added.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid name
    /// - `AlreadyExists` if the name is taken
    /// - `TooManyFiles` if the table is at `MAX_FILES` entries or the encoded
    ///   table would outgrow its region
    pub fn check_insert(&self, name: &str) -> Result<()> {
        validate_name(name)?;

        if self.find(name).is_some() {
            return Err(Error::AlreadyExists(format!("File '{}' already exists", name)));
        }
        if self.entries.len() >= MAX_FILES {
            return Err(Error::TooManyFiles(MAX_FILES));
        }
        if self.encoded_len() + FIXED_ENTRY_LEN + name.len() > CATALOG_SIZE {
            return Err(Error::TooManyFiles(self.entries.len()));
        }
        Ok(())
    }

    /// Add an entry.
    pub fn insert(&mut self, entry: FileEntry) -> Result<()> {
        self.check_insert(&entry.name)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Remove an entry by name.
    pub fn remove(&mut self, name: &str) -> Option<FileEntry> {
        let index = self.position(name)?;
        Some(self.entries.remove(index))
    }

    /// Table index of the entry called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Insert `entry` at `index`, or at the end if `index` is past it.
    pub fn insert_at(&mut self, index: usize, entry: FileEntry) -> Result<()> {
        self.check_insert(&entry.name)?;
        let index = index.min(self.entries.len());
        self.entries.insert(index, entry);
        Ok(())
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Total bytes held by files.
    pub fn used_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// First-fit search for `size` free bytes.
    ///
    /// Walks the entries in offset order looking at each gap, then the space
    /// after the last entry. Returned offsets are sector-aligned.
    pub fn allocate(&self, size: u64, volume_size: u64) -> Option<u64> {
        let mut extents: Vec<(u64, u64)> = self.entries.iter().map(|e| (e.offset, e.end())).collect();
        extents.sort_unstable();

        let mut cursor = DATA_START;
        for (start, end) in extents {
            if start >= cursor && start - cursor >= size {
                return Some(cursor);
            }
            cursor = cursor.max(align_up(end));
        }

        (volume_size >= cursor && volume_size - cursor >= size).then_some(cursor)
    }

    /// Serialized length without padding.
    pub fn encoded_len(&self) -> usize {
        COUNT_LEN + self.entries.iter().map(FileEntry::encoded_len).sum::<usize>()
    }

    /// Serialize into a full `CATALOG_SIZE` region.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.entries.len() > MAX_FILES || self.encoded_len() > CATALOG_SIZE {
            return Err(Error::TooManyFiles(self.entries.len()));
        }

        let mut out = Vec::with_capacity(CATALOG_SIZE);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&(entry.name.len() as u32).to_be_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&entry.size.to_be_bytes());
            out.extend_from_slice(&entry.offset.to_be_bytes());
            out.extend_from_slice(&entry.created_at.to_be_bytes());
        }
        out.resize(CATALOG_SIZE, 0);
        Ok(out)
    }

    /// Parse and validate a catalog region.
    ///
    /// # Errors
    /// - `Serialization` if the table is truncated, over the limits, holds
    ///   duplicate names, extents outside `[DATA_START, volume_size]` or
    ///   overlapping extents, or has bytes after the last entry
    pub fn decode(bytes: &[u8], volume_size: u64) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };

        let count = reader.u32()? as usize;
        if count > MAX_FILES {
            return Err(corrupt(format!("entry count {} over limit", count)));
        }

        let mut entries = Vec::with_capacity(count);
        let mut names = HashSet::with_capacity(count);
        for _ in 0..count {
            let name_len = reader.u32()? as usize;
            if name_len == 0 || name_len > MAX_FILENAME_LENGTH {
                return Err(corrupt(format!("name length {}", name_len)));
            }
            let name = std::str::from_utf8(reader.take(name_len)?)
                .map_err(|_| corrupt("name is not UTF-8".to_string()))?
                .to_string();
            let size = reader.u64()?;
            let offset = reader.u64()?;
            let created_at = reader.i64()?;

            let end = offset
                .checked_add(size)
                .ok_or_else(|| corrupt(format!("extent of '{}' overflows", name)))?;
            if offset < DATA_START || end > volume_size {
                return Err(corrupt(format!("extent of '{}' outside data region", name)));
            }
            if !names.insert(name.clone()) {
                return Err(corrupt(format!("duplicate name '{}'", name)));
            }

            entries.push(FileEntry {
                name,
                size,
                offset,
                created_at,
            });
        }

        if bytes[reader.pos..].iter().any(|&b| b != 0) {
            return Err(corrupt("trailing bytes after last entry".to_string()));
        }

        let mut extents: Vec<(u64, u64)> = entries.iter().map(|e| (e.offset, e.end())).collect();
        extents.sort_unstable();
        if extents.windows(2).any(|pair| pair[0].1 > pair[1].0) {
            return Err(corrupt("overlapping extents".to_string()));
        }

        Ok(Self { entries })
    }
}

/// Round a payload offset up to the next sector boundary.
fn align_up(value: u64) -> u64 {
    let sector = SECTOR_SIZE as u64;
    value.div_ceil(sector) * sector
}

fn corrupt(detail: String) -> Error {
    Error::Serialization(format!("Corrupt catalog: {}", detail))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| corrupt("truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }
}
