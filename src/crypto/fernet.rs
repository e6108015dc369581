//! Fernet tokens
//!
//! Token layout before base64 (urlsafe, padded):
//! `0x80 || timestamp (u64 BE) || IV (16) || AES-128-CBC ciphertext || HMAC-SHA256 (32)`.
//! The HMAC covers everything before it and is checked before any
//! decryption is attempted. Token age is not enforced.

use crate::crypto::{BLOCK_SIZE, IV_SIZE};
use crate::error::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use ring::hmac;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const VERSION: u8 = 0x80;
const TIMESTAMP_SIZE: usize = 8;
const HMAC_SIZE: usize = 32;
const HEADER_SIZE: usize = 1 + TIMESTAMP_SIZE + IV_SIZE;

/// Every token starts with the version byte followed by a timestamp whose
/// high bytes are zero for the foreseeable future.
const TOKEN_PREFIX: &[u8] = b"gAAAAA";

/// Whether a blob looks like a fernet token
pub fn looks_like_token(blob: &[u8]) -> bool {
    blob.starts_with(TOKEN_PREFIX)
}

/// Build a token for `plaintext`
pub fn encrypt(
    signing_key: &[u8],
    encryption_key: &[u8],
    plaintext: &[u8],
    timestamp: u64,
) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let encryptor = Aes128CbcEnc::new_from_slices(encryption_key, &iv)
        .map_err(|_| Error::Encryption("Invalid fernet encryption key".to_string()))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut raw = Vec::with_capacity(HEADER_SIZE + ciphertext.len() + HMAC_SIZE);
    raw.push(VERSION);
    raw.extend_from_slice(&timestamp.to_be_bytes());
    raw.extend_from_slice(&iv);
    raw.extend_from_slice(&ciphertext);

    let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, signing_key), &raw);
    raw.extend_from_slice(tag.as_ref());

    Ok(URL_SAFE.encode(&raw).into_bytes())
}

/// Verify and open a token
pub fn decrypt(signing_key: &[u8], encryption_key: &[u8], token: &[u8]) -> Result<Vec<u8>> {
    let token = token.trim_ascii_end();
    let raw = URL_SAFE
        .decode(token)
        .map_err(|e| Error::Decryption(format!("Fernet token is not base64: {}", e)))?;

    if raw.len() < HEADER_SIZE + BLOCK_SIZE + HMAC_SIZE {
        return Err(Error::Decryption("Fernet token too short".to_string()));
    }
    if raw[0] != VERSION {
        return Err(Error::Decryption(format!(
            "Unknown fernet version 0x{:02x}",
            raw[0]
        )));
    }

    let (signed, tag) = raw.split_at(raw.len() - HMAC_SIZE);
    hmac::verify(&hmac::Key::new(hmac::HMAC_SHA256, signing_key), signed, tag)
        .map_err(|_| Error::Decryption("Fernet signature mismatch".to_string()))?;

    let iv = &signed[1 + TIMESTAMP_SIZE..HEADER_SIZE];
    let ciphertext = &signed[HEADER_SIZE..];
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decryption(
            "Fernet ciphertext is not block aligned".to_string(),
        ));
    }

    let decryptor = Aes128CbcDec::new_from_slices(encryption_key, iv)
        .map_err(|_| Error::Decryption("Invalid fernet encryption key".to_string()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption("Bad fernet padding".to_string()))
}

/// Timestamp embedded in a token, without verifying it
pub fn timestamp_of(token: &[u8]) -> Option<u64> {
    let raw = URL_SAFE.decode(token.trim_ascii_end()).ok()?;
    let bytes: [u8; TIMESTAMP_SIZE] = raw.get(1..1 + TIMESTAMP_SIZE)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Exact token length for a plaintext of `plain_len` bytes
pub fn cipher_len(plain_len: u64) -> u64 {
    let raw = (HEADER_SIZE + HMAC_SIZE) as u64 + super::encryption::padded_len(plain_len);
    raw.div_ceil(3) * 4
}
