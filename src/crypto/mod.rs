//! Decryption support for encrypted RAR archives.
//!
//! Both formats use AES in CBC mode with format-specific key derivation:
//!
//! | Format | Cipher | KDF | Iterations |
//! |--------|--------|-----|------------|
//! | RAR 1.5-4.x | AES-128-CBC | SHA-1 based | 262,144 (2^18) |
//! | RAR 5.0 | AES-256-CBC | PBKDF2-HMAC-SHA256 | 2^(n+15), n from the header |
//!
//! Key derivation lives in [`rar15`] and [`rar50`]; this module provides
//! the stateful CBC decryptor shared by header decryption and the
//! file-data decode stack.

pub(crate) mod rar15;
pub(crate) mod rar50;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::{Aes128, Aes256};

use crate::error::{RarError, Result};

pub(crate) const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Stateful AES-CBC decryptor. Feeding it consecutive 16-byte blocks of
/// ciphertext continues the CBC chain across calls.
#[derive(Debug)]
pub(crate) enum CbcCipher {
    Aes128(Box<Aes128CbcDec>),
    Aes256(Box<Aes256CbcDec>),
}

impl CbcCipher {
    pub(crate) fn aes128(key: &[u8], iv: &[u8]) -> Result<Self> {
        let dec = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| RarError::Invalid)?;
        Ok(CbcCipher::Aes128(Box::new(dec)))
    }

    pub(crate) fn aes256(key: &[u8], iv: &[u8]) -> Result<Self> {
        let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| RarError::Invalid)?;
        Ok(CbcCipher::Aes256(Box::new(dec)))
    }

    /// Build the cipher matching the key length (16 → AES-128, 32 → AES-256).
    pub(crate) fn for_key(key: &[u8], iv: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Self::aes128(key, iv),
            32 => Self::aes256(key, iv),
            _ => Err(RarError::Invalid),
        }
    }

    /// Decrypt whole blocks in place. `data` must be block-aligned.
    pub(crate) fn decrypt_blocks(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(RarError::Invalid);
        }
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                CbcCipher::Aes128(dec) => dec.decrypt_block_mut(block),
                CbcCipher::Aes256(dec) => dec.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}
