//! AES-256-CBC piece encryption
//!
//! Blob layout: `IV (16 bytes) || ciphertext`, where the ciphertext carries
//! PKCS#7 padding and is therefore always a non-empty multiple of the block
//! size. A fresh random IV is drawn for every piece.

use crate::crypto::{BLOCK_SIZE, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt a piece with AES-256-CBC
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| Error::Encryption("Failed to create AES key".to_string()))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a piece produced by [`encrypt`]
pub fn decrypt(key: &[u8; KEY_SIZE], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < IV_SIZE + BLOCK_SIZE {
        return Err(Error::Decryption("Data too short".to_string()));
    }
    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decryption(format!(
            "Ciphertext length {} is not a multiple of the block size",
            ciphertext.len()
        )));
    }

    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::Decryption("Failed to create AES key".to_string()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption("Bad padding - data corrupted or wrong key".to_string()))
}

/// Exact blob size for a plaintext of `plain_len` bytes
pub fn cipher_len(plain_len: u64) -> u64 {
    IV_SIZE as u64 + padded_len(plain_len)
}

/// Length after PKCS#7 padding (always adds at least one byte)
pub(crate) fn padded_len(plain_len: u64) -> u64 {
    (plain_len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}
