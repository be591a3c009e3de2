//! Pre-shared key loading.
//!
//! Both peers share one 32-byte secret, stored on disk as 64 hex characters
//! with an optional trailing newline. Any other content is rejected.

use std::fmt;
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the pre-shared key in bytes.
pub const PSK_LEN: usize = 32;

/// Error type for key file loading.
#[derive(Debug, thiserror::Error)]
pub enum PskError {
    #[error("cannot read key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file must contain exactly {} hex characters", PSK_LEN * 2)]
    BadLength,
    #[error("key file is not valid hex")]
    BadHex,
}

/// The 32-byte pre-shared key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PreSharedKey([u8; PSK_LEN]);

impl PreSharedKey {
    /// Parse a key from its hex representation (trailing whitespace allowed).
    pub fn from_hex(text: &str) -> Result<Self, PskError> {
        let trimmed = text.trim_end();
        if trimmed.len() != PSK_LEN * 2 {
            return Err(PskError::BadLength);
        }
        let mut key = [0u8; PSK_LEN];
        hex::decode_to_slice(trimmed, &mut key).map_err(|_| PskError::BadHex)?;
        Ok(Self(key))
    }

    /// Load and parse the key file at `path`.
    pub fn load(path: &Path) -> Result<Self, PskError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_hex(&text)
    }

    pub fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }
}

impl PartialEq for PreSharedKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq::constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for PreSharedKey {}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.write_str("PreSharedKey(..)")
    }
}
