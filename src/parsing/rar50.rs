//! RAR 5.0 block-header decoding.
//!
//! Each block: u32 LE header CRC + vint header size + header body +
//! optional extra area + optional data area. The CRC covers the size
//! vint and the body and is verified before any field is interpreted.

use tracing::{debug, trace};

use super::vint::{read_uvarint, SliceReader};
use super::{truncated, NextBlock, MAX_HEADER_SIZE};
use crate::bufio::BufVolumeReader;
use crate::crypto::rar50::{derive_keys, Keys50, IV_SIZE, KDF_LG2_COUNT_MAX, SALT_SIZE};
use crate::crypto::{CbcCipher, AES_BLOCK_SIZE};
use crate::error::{RarError, Result};
use crate::format::{HostOs, RawTimestamp};
use crate::header::{FileBlockHeader, HashKind, DECODE_50};
use crate::options::Options;

// Header types
const HEAD_MAIN: u64 = 1;
const HEAD_FILE: u64 = 2;
const HEAD_SERVICE: u64 = 3;
const HEAD_CRYPT: u64 = 4;
const HEAD_END: u64 = 5;

// Common block flags
const BLOCK_HAS_EXTRA: u64 = 0x0001;
const BLOCK_HAS_DATA: u64 = 0x0002;
const BLOCK_SPLIT_BEFORE: u64 = 0x0008;
const BLOCK_SPLIT_AFTER: u64 = 0x0010;

// Main header flags
const MAIN_VOLUME: u64 = 0x0001;
const MAIN_HAS_VOLUME_NUMBER: u64 = 0x0002;
const MAIN_SOLID: u64 = 0x0004;

// File header flags
const FILE_IS_DIR: u64 = 0x0001;
const FILE_HAS_MTIME: u64 = 0x0002;
const FILE_HAS_CRC32: u64 = 0x0004;
const FILE_UNKNOWN_SIZE: u64 = 0x0008;

// End header flags
const END_NEXT_VOLUME: u64 = 0x0001;

// Extra record types in file headers
const EXTRA_CRYPT: u64 = 0x01;
const EXTRA_HASH: u64 = 0x02;
const EXTRA_TIME: u64 = 0x03;
const EXTRA_VERSION: u64 = 0x04;
const EXTRA_REDIR: u64 = 0x05;

// Crypt record flags
const CRYPT_PSW_CHECK: u64 = 0x01;
const CRYPT_USE_MAC: u64 = 0x02;

const HASH_BLAKE2SP: u64 = 0x00;
const BLAKE2SP_DIGEST_SIZE: usize = 32;

/// Bytes read ahead with the CRC to cover the size vint.
const SIZE_READAHEAD: usize = 3;

/// One decoded RAR 5 block: common fields plus the unparsed remainder.
struct Block50 {
    htype: u64,
    flags: u64,
    /// Body bytes after the common fields, including the extra area.
    body: Vec<u8>,
    extra_size: u64,
    data_size: u64,
}

/// RAR 5 block reader; carries archive flags, the optional header
/// encryption key and a small cache of derived file keys.
#[derive(Clone, Debug)]
pub(crate) struct Archive50 {
    password: Option<String>,
    pub(crate) multi: bool,
    pub(crate) solid: bool,
    /// Archive key for encrypted headers, set by the encryption block.
    block_keys: Option<Keys50>,
    key_cache: Vec<([u8; SALT_SIZE], u8, Keys50)>,
}

impl Archive50 {
    pub(crate) fn new(options: &Options) -> Self {
        Archive50 {
            password: options.password_bytes().map(str::to_string),
            multi: false,
            solid: false,
            block_keys: None,
            key_cache: Vec::new(),
        }
    }

    /// Each volume carries its own encryption block; the header key from
    /// the previous volume must not decrypt the next one's plaintext.
    pub(crate) fn reset_volume(&mut self) {
        self.block_keys = None;
    }

    fn keys_for(&mut self, salt: &[u8; SALT_SIZE], lg2_count: u8) -> Option<Keys50> {
        let password = self.password.as_deref()?;
        if let Some((_, _, keys)) = self
            .key_cache
            .iter()
            .find(|(s, c, _)| s == salt && *c == lg2_count)
        {
            return Some(keys.clone());
        }
        let keys = derive_keys(password, salt, lg2_count);
        self.key_cache.push((*salt, lg2_count, keys.clone()));
        Some(keys)
    }

    /// Read the raw bytes of one block header (CRC + size vint + body),
    /// decrypting when header encryption is active. Returns the size-vint
    /// bytes together with the body, and the verified body split point.
    ///
    /// `Ok(None)` means the volume ended cleanly at a block boundary.
    fn read_raw_header(&mut self, br: &mut BufVolumeReader) -> Result<Option<Vec<u8>>> {
        if self.block_keys.is_some() {
            return self.read_encrypted_header(br);
        }
        if br.peek(1).map_err(RarError::Io)?.is_empty() {
            return Ok(None);
        }
        let head = br
            .read_exact_vec(4 + SIZE_READAHEAD)
            .map_err(truncated)?;
        let crc = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let after_crc = &head[4..];
        let (size, vint_len) = match read_uvarint(after_crc) {
            Some(v) => v,
            // a size that needs more than 3 vint bytes exceeds the cap
            None => return Err(RarError::CorruptBlockHeader),
        };
        let over_read = after_crc.len() - vint_len;
        // historically exploited: a declared size smaller than what the
        // read-ahead already consumed would underflow the remainder
        if size < over_read as u64 {
            return Err(RarError::CorruptBlockHeader);
        }
        if size > MAX_HEADER_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        let mut raw = head[4..].to_vec();
        let remaining = size as usize - over_read;
        raw.extend(br.read_exact_vec(remaining).map_err(truncated)?);

        if crc32fast::hash(&raw) != crc {
            return Err(RarError::BadHeaderCrc);
        }
        // drop the size vint; the caller parses the body only
        raw.drain(..vint_len);
        Ok(Some(raw))
    }

    /// Encrypted headers: a 16-byte IV precedes each block; the block
    /// (CRC, size and body) is AES-256-CBC encrypted and padded to the
    /// cipher block size. Trailing padding is consumed so the next IV
    /// starts aligned.
    fn read_encrypted_header(&mut self, br: &mut BufVolumeReader) -> Result<Option<Vec<u8>>> {
        let keys = self.block_keys.as_ref().expect("encrypted header state");
        let first = match br.read_byte().map_err(RarError::Io)? {
            None => return Ok(None),
            Some(b) => b,
        };
        let mut iv = vec![first];
        iv.extend(br.read_exact_vec(IV_SIZE - 1).map_err(truncated)?);
        let mut cipher = CbcCipher::aes256(&keys.key, &iv)?;

        let mut buf = br.read_exact_vec(AES_BLOCK_SIZE).map_err(truncated)?;
        cipher.decrypt_blocks(&mut buf)?;

        let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let (size, vint_len) = match read_uvarint(&buf[4..]) {
            Some(v) => v,
            None => return Err(RarError::CorruptBlockHeader),
        };
        if size > MAX_HEADER_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        let total = 4 + vint_len + size as usize;
        let padded = total.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
        if padded > buf.len() {
            let mut more = br.read_exact_vec(padded - buf.len()).map_err(truncated)?;
            cipher.decrypt_blocks(&mut more)?;
            buf.extend_from_slice(&more);
        }
        if crc32fast::hash(&buf[4..total]) != crc {
            return Err(RarError::BadHeaderCrc);
        }
        Ok(Some(buf[4 + vint_len..total].to_vec()))
    }

    /// Decode the common fields of one block.
    fn read_block(&mut self, br: &mut BufVolumeReader) -> Result<Option<Block50>> {
        let raw = match self.read_raw_header(br)? {
            None => return Ok(None),
            Some(r) => r,
        };
        let corrupt = || RarError::CorruptBlockHeader;
        let mut b = SliceReader::new(&raw);
        let htype = b.uvarint().ok_or_else(corrupt)?;
        let flags = b.uvarint().ok_or_else(corrupt)?;
        let extra_size = if flags & BLOCK_HAS_EXTRA != 0 {
            b.uvarint().ok_or_else(corrupt)?
        } else {
            0
        };
        let data_size = if flags & BLOCK_HAS_DATA != 0 {
            b.uvarint().ok_or_else(corrupt)?
        } else {
            0
        };
        if extra_size > raw.len() as u64 {
            return Err(RarError::CorruptBlockHeader);
        }
        let body = raw[raw.len() - b.remaining()..].to_vec();
        trace!(htype, flags, extra_size, data_size, "rar5 block");
        Ok(Some(Block50 {
            htype,
            flags,
            body,
            extra_size,
            data_size,
        }))
    }

    pub(crate) fn next_block(
        &mut self,
        br: &mut BufVolumeReader,
        volnum: usize,
    ) -> Result<NextBlock> {
        loop {
            let block = match self.read_block(br)? {
                None => return Ok(NextBlock::EndOfArchive),
                Some(b) => b,
            };
            match block.htype {
                HEAD_MAIN => {
                    let mut b = SliceReader::new(&block.body);
                    let arc_flags = b.uvarint().ok_or(RarError::CorruptBlockHeader)?;
                    self.multi = arc_flags & MAIN_VOLUME != 0;
                    self.solid = arc_flags & MAIN_SOLID != 0;
                    if arc_flags & MAIN_HAS_VOLUME_NUMBER != 0 {
                        let _volume_number = b.uvarint().ok_or(RarError::CorruptBlockHeader)?;
                    }
                    debug!(multi = self.multi, solid = self.solid, "rar5 main header");
                    br.discard(block.data_size).map_err(truncated)?;
                }
                HEAD_CRYPT => {
                    self.parse_encryption_block(&block.body)?;
                }
                HEAD_FILE => {
                    let h = self.parse_file_block(&block, br.offset(), volnum)?;
                    return Ok(NextBlock::File(h));
                }
                HEAD_SERVICE => {
                    br.discard(block.data_size).map_err(truncated)?;
                }
                HEAD_END => {
                    let mut b = SliceReader::new(&block.body);
                    let end_flags = b.uvarint().ok_or(RarError::CorruptBlockHeader)?;
                    return if end_flags & END_NEXT_VOLUME != 0 {
                        Ok(NextBlock::EndOfVolume)
                    } else {
                        Ok(NextBlock::EndOfArchive)
                    };
                }
                _ => {
                    // unknown block: framing lets us skip it by size
                    br.discard(block.data_size).map_err(truncated)?;
                }
            }
        }
    }

    /// Archive-level encryption block: all subsequent headers are
    /// encrypted under a key derived from the password and this salt.
    fn parse_encryption_block(&mut self, body: &[u8]) -> Result<()> {
        let corrupt = || RarError::CorruptBlockHeader;
        let mut b = SliceReader::new(body);
        let version = b.uvarint().ok_or_else(corrupt)?;
        if version != 0 {
            return Err(RarError::UnknownVersion);
        }
        let flags = b.uvarint().ok_or_else(corrupt)?;
        let lg2_count = b.byte().ok_or_else(corrupt)?;
        if lg2_count > KDF_LG2_COUNT_MAX {
            return Err(RarError::CorruptBlockHeader);
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(b.take(SALT_SIZE).ok_or_else(corrupt)?);

        if self.password.is_none() {
            return Err(RarError::ArchivedFileEncrypted);
        }
        let keys = self.keys_for(&salt, lg2_count).expect("password checked");
        if flags & CRYPT_PSW_CHECK != 0 {
            let mut check = [0u8; 8];
            check.copy_from_slice(b.take(8).ok_or_else(corrupt)?);
            if !keys.verify_password(&check) {
                return Err(RarError::WrongPassword);
            }
        }
        debug!("rar5 header encryption enabled");
        self.block_keys = Some(keys);
        Ok(())
    }

    fn parse_file_block(
        &mut self,
        block: &Block50,
        data_off: u64,
        volnum: usize,
    ) -> Result<FileBlockHeader> {
        let corrupt = || RarError::CorruptBlockHeader;
        let body = &block.body;
        if block.extra_size > body.len() as u64 {
            return Err(RarError::CorruptBlockHeader);
        }
        let fields_len = body.len() - block.extra_size as usize;
        let mut b = SliceReader::new(&body[..fields_len]);

        let file_flags = b.uvarint().ok_or_else(corrupt)?;
        let unpacked_size = b.uvarint().ok_or_else(corrupt)?;
        let attributes = b.uvarint().ok_or_else(corrupt)?;
        let mtime = if file_flags & FILE_HAS_MTIME != 0 {
            Some(b.le32().ok_or_else(corrupt)?)
        } else {
            None
        };
        let file_crc = if file_flags & FILE_HAS_CRC32 != 0 {
            Some(b.le32().ok_or_else(corrupt)?)
        } else {
            None
        };
        let comp_info = b.uvarint().ok_or_else(corrupt)?;
        let host_os = b.uvarint().ok_or_else(corrupt)?;
        let name_len = b.uvarint().ok_or_else(corrupt)? as usize;
        let raw_name = b.take(name_len).ok_or_else(corrupt)?;
        let name = String::from_utf8_lossy(raw_name).replace('\\', "/");

        let is_dir = file_flags & FILE_IS_DIR != 0;
        let unknown_size = file_flags & FILE_UNKNOWN_SIZE != 0;

        // compression info: bits 0-5 version, bit 6 solid, bits 7-9
        // method, bits 10-13 log2 window size above 128 KiB
        let comp_version = (comp_info & 0x3f) as u8;
        let solid = comp_info & 0x40 != 0;
        let method = ((comp_info >> 7) & 0x07) as u8;
        let win_size = if is_dir || method == 0 {
            0
        } else {
            0x20000u64 << ((comp_info >> 10) & 0x0f)
        };
        let dec_ver = if method == 0 {
            0
        } else {
            DECODE_50 + comp_version
        };

        let mut h = FileBlockHeader {
            first: block.flags & BLOCK_SPLIT_BEFORE == 0,
            last: block.flags & BLOCK_SPLIT_AFTER == 0,
            volnum,
            data_off,
            dec_ver,
            win_size,
            arc_solid: self.solid,
            hash: (!is_dir)
                .then(|| file_crc.map(|c| (HashKind::Crc32, c.to_le_bytes().to_vec())))
                .flatten(),
            ..Default::default()
        };
        h.h.name = name;
        h.h.is_dir = is_dir;
        h.h.solid = solid;
        h.h.header_encrypted = self.block_keys.is_some();
        h.h.host_os = HostOs::from_rar50(host_os);
        h.h.attributes = attributes;
        h.h.packed_size = block.data_size as i64;
        h.h.unpacked_size = if unknown_size { -1 } else { unpacked_size as i64 };
        h.h.unknown_size = unknown_size;
        h.h.offset = data_off;
        h.h.volume_number = volnum;
        if let Some(t) = mtime {
            h.h.modification_time = RawTimestamp::from_unix_secs(t as i64);
        }

        if block.extra_size > 0 {
            self.parse_file_extra(&body[fields_len..], &mut h)?;
        }

        trace!(
            name = %h.h.name,
            packed = h.h.packed_size,
            first = h.first,
            last = h.last,
            encrypted = h.h.encrypted,
            "rar5 file block"
        );
        Ok(h)
    }

    /// Typed extra records appended to file headers.
    fn parse_file_extra(&mut self, extra: &[u8], h: &mut FileBlockHeader) -> Result<()> {
        let corrupt = || RarError::CorruptBlockHeader;
        let mut area = SliceReader::new(extra);
        while area.remaining() > 0 {
            let record_size = area.uvarint().ok_or_else(corrupt)? as usize;
            let record = area.take(record_size).ok_or_else(corrupt)?;
            let mut r = SliceReader::new(record);
            let rtype = r.uvarint().ok_or_else(corrupt)?;
            match rtype {
                EXTRA_CRYPT => self.parse_file_encryption(&mut r, h)?,
                EXTRA_HASH => {
                    let hash_type = r.uvarint().ok_or_else(corrupt)?;
                    if hash_type == HASH_BLAKE2SP {
                        let digest = r.take(BLAKE2SP_DIGEST_SIZE).ok_or_else(corrupt)?;
                        if !h.h.is_dir {
                            h.hash = Some((HashKind::Blake2sp, digest.to_vec()));
                        }
                    }
                }
                EXTRA_TIME => parse_file_times(&mut r, &mut h.h)?,
                EXTRA_VERSION => {
                    let _flags = r.uvarint().ok_or_else(corrupt)?;
                    h.h.version = r.uvarint().ok_or_else(corrupt)? as u32;
                }
                EXTRA_REDIR => {
                    // recognized but not surfaced: redirection target
                    let _redir_type = r.uvarint().ok_or_else(corrupt)?;
                    let _flags = r.uvarint().ok_or_else(corrupt)?;
                    let target_len = r.uvarint().ok_or_else(corrupt)? as usize;
                    r.take(target_len).ok_or_else(corrupt)?;
                }
                _ => {} // owner, service data and future records: skip
            }
        }
        Ok(())
    }

    /// Per-file encryption record: KDF parameters, IV, and flags
    /// selecting password-check and keyed-checksum behavior.
    fn parse_file_encryption(
        &mut self,
        r: &mut SliceReader<'_>,
        h: &mut FileBlockHeader,
    ) -> Result<()> {
        let corrupt = || RarError::CorruptBlockHeader;
        let version = r.uvarint().ok_or_else(corrupt)?;
        if version != 0 {
            return Err(RarError::UnknownVersion);
        }
        let flags = r.uvarint().ok_or_else(corrupt)?;
        let lg2_count = r.byte().ok_or_else(corrupt)?;
        if lg2_count > KDF_LG2_COUNT_MAX {
            return Err(RarError::CorruptBlockHeader);
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(r.take(SALT_SIZE).ok_or_else(corrupt)?);
        let iv = r.take(IV_SIZE).ok_or_else(corrupt)?.to_vec();

        h.h.encrypted = true;
        h.salt = salt.to_vec();
        h.iv = iv;
        h.kdf_count = 1u32 << lg2_count;

        if let Some(keys) = self.keys_for(&salt, lg2_count) {
            if flags & CRYPT_PSW_CHECK != 0 {
                let mut check = [0u8; 8];
                check.copy_from_slice(r.take(8).ok_or_else(corrupt)?);
                if !keys.verify_password(&check) {
                    return Err(RarError::WrongPassword);
                }
            }
            if flags & CRYPT_USE_MAC != 0 {
                h.hash_key = keys.hash_key.to_vec();
            }
            h.key = Some(keys.key.to_vec());
            h.kdf_count = keys.iterations;
        }
        Ok(())
    }
}

/// High-precision time record: per-timestamp Unix or FILETIME values with
/// optional nanosecond reminders.
fn parse_file_times(r: &mut SliceReader<'_>, h: &mut crate::header::FileHeader) -> Result<()> {
    const TIME_UNIX: u64 = 0x01;
    const TIME_MTIME: u64 = 0x02;
    const TIME_CTIME: u64 = 0x04;
    const TIME_ATIME: u64 = 0x08;
    const TIME_UNIX_NS: u64 = 0x10;

    let corrupt = || RarError::CorruptBlockHeader;
    let flags = r.uvarint().ok_or_else(corrupt)?;
    let unix = flags & TIME_UNIX != 0;
    let mut times = [RawTimestamp::default(); 3];
    let present = [
        flags & TIME_MTIME != 0,
        flags & TIME_CTIME != 0,
        flags & TIME_ATIME != 0,
    ];
    for (slot, &p) in times.iter_mut().zip(&present) {
        if !p {
            continue;
        }
        *slot = if unix {
            RawTimestamp::from_unix_secs(r.le32().ok_or_else(corrupt)? as i64)
        } else {
            RawTimestamp::from_windows_filetime(r.le64().ok_or_else(corrupt)?)
        };
    }
    if unix && flags & TIME_UNIX_NS != 0 {
        for (slot, &p) in times.iter_mut().zip(&present) {
            if !p {
                continue;
            }
            let ns = r.le32().ok_or_else(corrupt)?;
            *slot = slot.saturating_add(ns as i64);
        }
    }
    if present[0] {
        h.modification_time = times[0];
    }
    if present[1] {
        h.creation_time = times[1];
    }
    if present[2] {
        h.access_time = times[2];
    }
    Ok(())
}
