//! Cryptography module for cryptmirror
//!
//! Pieces are encrypted independently with either AES-256-CBC or fernet.
//! Nothing leaves the local system unencrypted.

mod codec;
mod encryption;
pub mod fernet;
mod keys;

pub use codec::{Algorithm, ChunkCodec};
pub use encryption::{cipher_len, decrypt, encrypt};
pub use keys::BackupKey;

use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY, SHA256};

/// Size of the backup key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a CBC initialization vector
pub const IV_SIZE: usize = 16;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Hex characters of the key fingerprint used in piece names
pub const FINGERPRINT_LEN: usize = 8;

/// Hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest(&SHA256, data).as_ref())
}

/// Hex SHA-1 of `data`; only used to derive opaque piece names
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, data).as_ref())
}
