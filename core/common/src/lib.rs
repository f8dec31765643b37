//! Common utilities and types shared across the SecureVault engine.
//!
//! This module provides the error taxonomy used by every layer of the engine
//! and a few small types for handling sensitive data and timestamps.

pub mod error;
pub mod types;

pub use error::{Error, Result, AUTH_FAILURE};
pub use types::{now_millis, timestamp_to_datetime, SensitiveBytes};
