//! RAR 5.0 key derivation (PBKDF2-HMAC-SHA256).
//!
//! Three 32-byte values are derived from the password and the 16-byte
//! salt: the AES-256 key at the header's iteration count, the checksum
//! HMAC key at +16 iterations, and the password-check value at +32.
//! The iteration count is stored as a log2 exponent.

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

pub(crate) const SALT_SIZE: usize = 16;
pub(crate) const IV_SIZE: usize = 16;
pub(crate) const PSW_CHECK_SIZE: usize = 8;

/// Largest accepted log2 iteration count; higher values are hostile.
pub(crate) const KDF_LG2_COUNT_MAX: u8 = 24;

/// Key material derived from one (password, salt, count) tuple.
#[derive(Clone, Debug)]
pub(crate) struct Keys50 {
    /// AES-256 file/header key.
    pub key: [u8; 32],
    /// HMAC-SHA-256 key applied over checksums of encrypted files.
    pub hash_key: [u8; 32],
    /// Password verification value.
    pub check_value: [u8; 32],
    /// Effective iteration count (2^lg2_count).
    pub iterations: u32,
}

pub(crate) fn derive_keys(password: &str, salt: &[u8; SALT_SIZE], lg2_count: u8) -> Keys50 {
    let iterations = 1u32 << lg2_count.min(KDF_LG2_COUNT_MAX);

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);

    let mut hash_key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations + 16, &mut hash_key);

    let mut check_value = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations + 32, &mut check_value);

    Keys50 {
        key,
        hash_key,
        check_value,
        iterations,
    }
}

impl Keys50 {
    /// Verify the password against the stored 8-byte check value
    /// (the 32-byte check value XOR-folded into 8 bytes).
    pub(crate) fn verify_password(&self, stored: &[u8; PSW_CHECK_SIZE]) -> bool {
        let mut check = [0u8; PSW_CHECK_SIZE];
        for (i, &b) in self.check_value.iter().enumerate() {
            check[i % PSW_CHECK_SIZE] ^= b;
        }
        check == *stored
    }
}

/// HMAC-SHA-256 over a file digest using the derived hash key.
///
/// Encrypted RAR 5 files store keyed checksums so the archive does not
/// leak plaintext CRCs; the stored digest is compared against this MAC.
pub(crate) fn hmac_sum(hash_key: &[u8], digest: &[u8]) -> [u8; 32] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(hash_key).expect("HMAC accepts any key length");
    mac.update(digest);
    mac.finalize().into_bytes().into()
}

/// Fold a 32-byte MAC down to a 4-byte CRC32 slot by XOR.
pub(crate) fn fold_to_crc32(mac: &[u8; 32]) -> [u8; 4] {
    let mut out = [0u8; 4];
    for (i, &b) in mac.iter().enumerate() {
        out[i & 3] ^= b;
    }
    out
}
