//! Legacy (RAR 3.x/4.x) key derivation.
//!
//! The password is encoded as UTF-16LE and concatenated with the 8-byte
//! salt; 2^18 iterations of SHA-1 over that seed plus a 3-byte counter
//! yield the AES-128 key (first 16 digest bytes, word-endian swapped) and
//! the IV (byte 19 of intermediate digests, one per 16384 iterations).

use sha1::{Digest, Sha1};

pub(crate) const SALT_SIZE: usize = 8;

/// KDF round count, fixed by the format.
pub(crate) const KDF_ROUNDS: u32 = 0x40000;

/// Derived AES-128 key and IV.
#[derive(Clone, Debug)]
pub(crate) struct LegacyKeys {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

/// Derive key and IV from password and salt.
pub(crate) fn derive_keys(password: &str, salt: &[u8; SALT_SIZE]) -> LegacyKeys {
    let seed: Vec<u8> = password
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .chain(salt.iter().copied())
        .collect();

    let mut hasher = Sha1::new();
    let mut iv = [0u8; 16];

    // 16 outer rounds (one IV byte each), 0x4000 inner iterations apiece
    for i in 0..16u32 {
        for j in 0..0x4000u32 {
            let cnt = i * 0x4000 + j;
            let cnt_bytes = [cnt as u8, (cnt >> 8) as u8, (cnt >> 16) as u8];
            hasher.update(&seed);
            hasher.update(cnt_bytes);
            if j == 0 {
                let digest = hasher.clone().finalize();
                iv[i as usize] = digest[19];
            }
        }
    }

    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    // each 32-bit word of the digest is stored byte-swapped
    for w in 0..4 {
        key[w * 4] = digest[w * 4 + 3];
        key[w * 4 + 1] = digest[w * 4 + 2];
        key[w * 4 + 2] = digest[w * 4 + 1];
        key[w * 4 + 3] = digest[w * 4];
    }

    LegacyKeys { key, iv }
}
