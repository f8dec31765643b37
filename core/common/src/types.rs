//! Common types used throughout SecureVault.

use chrono::{DateTime, Utc};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds into a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn timestamp_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Sensitive data wrapper that zeroizes on drop.
///
/// Used for passwords travelling from the caller into key derivation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SensitiveBytes {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl PartialEq for SensitiveBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && bool::from(self.0.as_slice().ct_eq(other.0.as_slice()))
    }
}

impl Eq for SensitiveBytes {}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_bytes_redacted() {
        let secret = SensitiveBytes::new(b"hunter2".to_vec());
        assert_eq!(secret.len(), 7);
        assert_eq!(format!("{:?}", secret), "SensitiveBytes([REDACTED; 7 bytes])");
    }

    #[test]
    fn test_sensitive_bytes_eq() {
        let a = SensitiveBytes::from("password".to_string());
        let b = SensitiveBytes::new(b"password".to_vec());
        let c = SensitiveBytes::new(b"passw0rd".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = now_millis();
        assert_eq!(timestamp_to_datetime(now).timestamp_millis(), now);
        assert_eq!(timestamp_to_datetime(0), DateTime::UNIX_EPOCH);
    }
}
