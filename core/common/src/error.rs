//! Common error types for SecureVault.

use thiserror::Error;

/// Message returned for every failed unlock.
///
/// Wrong passwords, tampered headers and truncated files all surface with
/// this exact text so callers cannot tell them apart.
pub const AUTH_FAILURE: &str = "wrong password or corrupt volume";

/// Top-level error type for SecureVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Key derivation failed (PRF unavailable or rejected its parameters).
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Header bytes are malformed, too short or carry the wrong magic.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// PKCS7 padding did not validate.
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Volume operation failed.
    #[error("Volume error: {0}")]
    Volume(String),

    /// Access outside the payload region.
    #[error("Volume error: out of bounds (offset {offset}, length {length}, volume size {size})")]
    OutOfBounds {
        offset: u64,
        length: u64,
        size: u64,
    },

    /// The volume handle has been closed.
    #[error("Volume error: volume is closed")]
    VolumeClosed,

    /// The path already has an open (or opening) handle.
    #[error("Volume error: volume is already open: {0}")]
    AlreadyOpen(String),

    /// The path has no open handle.
    #[error("Volume error: volume is not open: {0}")]
    NotOpen(String),

    /// No free extent large enough for the request.
    #[error("Volume error: not enough space (required {required} bytes, free {available} bytes)")]
    NoSpace { required: u64, available: u64 },

    /// The file table cannot hold another entry.
    #[error("Volume error: file table is full ({0} entries)")]
    TooManyFiles(usize),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Opaque unlock failure.
    pub fn auth_failure() -> Self {
        Error::Volume(AUTH_FAILURE.to_string())
    }

    /// Whether this error belongs to the volume error family.
    ///
    /// Covers unlock failures, bounds and lifecycle violations, registry
    /// conflicts, exhausted space and missing or duplicate files.
    pub fn is_volume_error(&self) -> bool {
        matches!(
            self,
            Error::Volume(_)
                | Error::OutOfBounds { .. }
                | Error::VolumeClosed
                | Error::AlreadyOpen(_)
                | Error::NotOpen(_)
                | Error::NoSpace { .. }
                | Error::TooManyFiles(_)
                | Error::NotFound(_)
                | Error::AlreadyExists(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
