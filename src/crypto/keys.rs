//! Key material for a backup
//!
//! The caller supplies 32 bytes of key material; no stretching is done.
//! The key's fingerprint (first 8 hex chars of its SHA-256) namespaces
//! piece names so that two keys never write over each other's blobs.

use crate::crypto::{FINGERPRINT_LEN, KEY_SIZE};
use crate::error::{Error, Result};
use ring::digest::{digest, SHA256};
use std::fmt;
use zeroize::Zeroizing;

/// 256-bit backup key
#[derive(Clone)]
pub struct BackupKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    fingerprint: String,
}

impl BackupKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Config("Encryption key is empty".to_string()));
        }
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);

        let hash = digest(&SHA256, bytes);
        let mut fingerprint = hex::encode(hash.as_ref());
        fingerprint.truncate(FINGERPRINT_LEN);

        Ok(BackupKey { key, fingerprint })
    }

    /// Parse a key given as 64 hex characters or as 32 raw characters
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.len() == 2 * KEY_SIZE && text.bytes().all(|b| b.is_ascii_hexdigit()) {
            let bytes = Zeroizing::new(
                hex::decode(text).map_err(|e| Error::Config(format!("Invalid hex key: {}", e)))?,
            );
            return Self::from_bytes(&bytes);
        }
        Self::from_bytes(text.as_bytes())
    }

    /// Get the raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Short hex fingerprint used to namespace remote names
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Fernet signing half
    pub fn signing_key(&self) -> &[u8] {
        &self.key[..KEY_SIZE / 2]
    }

    /// Fernet encryption half
    pub fn encryption_key(&self) -> &[u8] {
        &self.key[KEY_SIZE / 2..]
    }
}

impl fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
