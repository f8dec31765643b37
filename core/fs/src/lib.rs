//! Flat file table on top of an encrypted volume.
//!
//! The first 64 KiB of a volume's payload hold the catalog; file contents
//! follow, placed by a first-fit allocator.

pub mod catalog;
pub mod filesystem;

pub use catalog::{
    Catalog, FileEntry, CATALOG_SIZE, DATA_START, MAX_FILENAME_LENGTH, MAX_FILES,
};
pub use filesystem::VolumeFileSystem;
