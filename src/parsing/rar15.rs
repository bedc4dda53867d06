//! Legacy (RAR 1.5 - 4.x) block-header decoding.
//!
//! Each block: u16 CRC + type byte + u16 flags + u16 size + optional
//! 4-byte add-size + type-specific body. The header CRC is the low 16
//! bits of a CRC-32 over everything after the CRC field.

use tracing::{debug, trace};

use super::vint::SliceReader;
use super::{truncated, NextBlock};
use crate::bufio::BufVolumeReader;
use crate::crypto::rar15::{derive_keys, LegacyKeys, KDF_ROUNDS, SALT_SIZE};
use crate::crypto::{CbcCipher, AES_BLOCK_SIZE};
use crate::error::{RarError, Result};
use crate::format::{HostOs, RawTimestamp};
use crate::header::{FileBlockHeader, HashKind};
use crate::options::Options;

// Block types
const BLOCK_MAIN: u8 = 0x73;
const BLOCK_FILE: u8 = 0x74;
const BLOCK_END: u8 = 0x7b;

// Main header flags
const MAIN_VOLUME: u16 = 0x0001;
const MAIN_SOLID: u16 = 0x0008;
const MAIN_NEW_NAMING: u16 = 0x0010;
const MAIN_ENCRYPTED: u16 = 0x0080;

// File header flags
const FILE_SPLIT_BEFORE: u16 = 0x0001;
const FILE_SPLIT_AFTER: u16 = 0x0002;
const FILE_ENCRYPTED: u16 = 0x0004;
const FILE_SOLID: u16 = 0x0010;
const FILE_WINDOW_MASK: u16 = 0x00e0;
const FILE_LARGE: u16 = 0x0100;
const FILE_UNICODE: u16 = 0x0200;
const FILE_SALT: u16 = 0x0400;
const FILE_EXT_TIME: u16 = 0x1000;

// End header flags
const END_NEXT_VOLUME: u16 = 0x0001;

// Generic block flags
const BLOCK_LONG: u16 = 0x8000;

const HEAD_SIZE: usize = 7;

/// One decoded legacy block head plus its body bytes.
struct Block15 {
    htype: u8,
    flags: u16,
    body: Vec<u8>,
    /// Size of the data area following the header.
    data_size: u64,
}

/// Legacy block reader; carries the archive-level state declared by the
/// main header (volume set, solid, naming scheme, header encryption).
#[derive(Clone, Debug)]
pub(crate) struct Archive15 {
    password: Option<String>,
    pub(crate) multi: bool,
    pub(crate) old_naming: bool,
    pub(crate) solid: bool,
    encrypted: bool,
    key_cache: Vec<([u8; SALT_SIZE], LegacyKeys)>,
}

impl Archive15 {
    pub(crate) fn new(options: &Options) -> Self {
        Archive15 {
            password: options.password_bytes().map(str::to_string),
            multi: false,
            old_naming: true,
            solid: false,
            encrypted: false,
            key_cache: Vec::new(),
        }
    }

    /// Header encryption is redeclared by each volume's main header.
    pub(crate) fn reset_volume(&mut self) {
        self.encrypted = false;
    }

    fn keys_for(&mut self, salt: &[u8; SALT_SIZE]) -> Option<LegacyKeys> {
        let password = self.password.as_deref()?;
        if let Some((_, keys)) = self.key_cache.iter().find(|(s, _)| s == salt) {
            return Some(keys.clone());
        }
        let keys = derive_keys(password, salt);
        self.key_cache.push((*salt, keys.clone()));
        Some(keys)
    }

    /// Read one raw block head + body. `Ok(None)` means the volume ended
    /// cleanly at a block boundary (legacy archives may omit the end block).
    fn read_block(&mut self, br: &mut BufVolumeReader) -> Result<Option<Block15>> {
        if self.encrypted {
            return self.read_encrypted_block(br);
        }
        if br.peek(1).map_err(RarError::Io)?.is_empty() {
            return Ok(None);
        }
        let head = br.read_exact_vec(HEAD_SIZE).map_err(truncated)?;
        let crc = u16::from_le_bytes([head[0], head[1]]);
        let htype = head[2];
        let flags = u16::from_le_bytes([head[3], head[4]]);
        let size = u16::from_le_bytes([head[5], head[6]]) as usize;
        if size < HEAD_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        let body = br.read_exact_vec(size - HEAD_SIZE).map_err(truncated)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head[2..]);
        hasher.update(&body);
        if (hasher.finalize() & 0xffff) as u16 != crc {
            return Err(RarError::BadHeaderCrc);
        }
        self.finish_block(htype, flags, body)
    }

    /// Encrypted variant: an 8-byte salt precedes each block; the header
    /// is AES-128-CBC encrypted and padded to the cipher block size.
    fn read_encrypted_block(&mut self, br: &mut BufVolumeReader) -> Result<Option<Block15>> {
        let first = match br.read_byte().map_err(RarError::Io)? {
            None => return Ok(None),
            Some(b) => b,
        };
        let mut salt = [0u8; SALT_SIZE];
        salt[0] = first;
        let rest = br.read_exact_vec(SALT_SIZE - 1).map_err(truncated)?;
        salt[1..].copy_from_slice(&rest);
        let keys = self.keys_for(&salt).ok_or(RarError::ArchivedFileEncrypted)?;
        let mut cipher = CbcCipher::aes128(&keys.key, &keys.iv)?;

        let mut buf = br.read_exact_vec(AES_BLOCK_SIZE).map_err(truncated)?;
        cipher.decrypt_blocks(&mut buf)?;
        let crc = u16::from_le_bytes([buf[0], buf[1]]);
        let htype = buf[2];
        let flags = u16::from_le_bytes([buf[3], buf[4]]);
        let size = u16::from_le_bytes([buf[5], buf[6]]) as usize;
        if size < HEAD_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        // the writer pads the header to a whole number of cipher blocks
        let padded = size.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
        if padded > buf.len() {
            let mut more = br.read_exact_vec(padded - buf.len()).map_err(truncated)?;
            cipher.decrypt_blocks(&mut more)?;
            buf.extend_from_slice(&more);
        }
        let body = buf[HEAD_SIZE..size].to_vec();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[2..size]);
        if (hasher.finalize() & 0xffff) as u16 != crc {
            return Err(RarError::BadHeaderCrc);
        }
        self.finish_block(htype, flags, body)
    }

    fn finish_block(&mut self, htype: u8, flags: u16, body: Vec<u8>) -> Result<Option<Block15>> {
        let data_size = if flags & BLOCK_LONG != 0 {
            let mut b = SliceReader::new(&body);
            b.le32().ok_or(RarError::CorruptBlockHeader)? as u64
        } else {
            0
        };
        trace!(htype, flags, data_size, "legacy block");
        Ok(Some(Block15 {
            htype,
            flags,
            body,
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
                BLOCK_MAIN => {
                    self.multi = block.flags & MAIN_VOLUME != 0;
                    self.solid = block.flags & MAIN_SOLID != 0;
                    self.old_naming = block.flags & MAIN_NEW_NAMING == 0;
                    self.encrypted = block.flags & MAIN_ENCRYPTED != 0;
                    if self.encrypted && self.password.is_none() {
                        return Err(RarError::ArchivedFileEncrypted);
                    }
                    debug!(
                        multi = self.multi,
                        solid = self.solid,
                        encrypted = self.encrypted,
                        "legacy main header"
                    );
                    br.discard(block.data_size).map_err(truncated)?;
                }
                BLOCK_FILE => {
                    let h = self.parse_file_block(&block, br.offset(), volnum)?;
                    return Ok(NextBlock::File(h));
                }
                BLOCK_END => {
                    return if block.flags & END_NEXT_VOLUME != 0 {
                        Ok(NextBlock::EndOfVolume)
                    } else {
                        Ok(NextBlock::EndOfArchive)
                    };
                }
                _ => {
                    // comment, recovery and other service blocks
                    br.discard(block.data_size).map_err(truncated)?;
                }
            }
        }
    }

    fn parse_file_block(
        &mut self,
        block: &Block15,
        data_off: u64,
        volnum: usize,
    ) -> Result<FileBlockHeader> {
        let corrupt = || RarError::CorruptBlockHeader;
        let mut b = SliceReader::new(&block.body);
        let flags = block.flags;

        let mut packed_size = b.le32().ok_or_else(corrupt)? as u64;
        let mut unpacked_size = b.le32().ok_or_else(corrupt)? as u64;
        let host_os = b.byte().ok_or_else(corrupt)?;
        let file_crc = b.le32().ok_or_else(corrupt)?;
        let dos_time = b.le32().ok_or_else(corrupt)?;
        let unp_ver = b.byte().ok_or_else(corrupt)?;
        let method = b.byte().ok_or_else(corrupt)?;
        let name_size = b.le16().ok_or_else(corrupt)? as usize;
        let attributes = b.le32().ok_or_else(corrupt)? as u64;

        let large = flags & FILE_LARGE != 0;
        let mut unknown_size = false;
        if large {
            let packed_high = b.le32().ok_or_else(corrupt)? as u64;
            let unpacked_high = b.le32().ok_or_else(corrupt)? as u64;
            packed_size |= packed_high << 32;
            unpacked_size |= unpacked_high << 32;
        } else if unpacked_size == u32::MAX as u64 {
            unknown_size = true;
        }

        let raw_name = b.take(name_size).ok_or_else(corrupt)?;
        let name = decode_file_name(raw_name, flags & FILE_UNICODE != 0);

        let is_dir = flags & FILE_WINDOW_MASK == FILE_WINDOW_MASK;
        let win_size = if is_dir {
            0
        } else {
            0x10000u64 << ((flags & FILE_WINDOW_MASK) >> 5)
        };

        let encrypted = flags & FILE_ENCRYPTED != 0;
        let mut salt = Vec::new();
        let mut key = None;
        let mut iv = Vec::new();
        // some writers store the salt without setting the salt flag
        let implied_salt =
            encrypted && flags & FILE_EXT_TIME == 0 && b.remaining() >= SALT_SIZE;
        if flags & FILE_SALT != 0 || implied_salt {
            if let Some(raw_salt) = b.take(SALT_SIZE) {
                let mut s = [0u8; SALT_SIZE];
                s.copy_from_slice(raw_salt);
                salt = s.to_vec();
                if encrypted {
                    if let Some(keys) = self.keys_for(&s) {
                        key = Some(keys.key.to_vec());
                        iv = keys.iv.to_vec();
                    }
                }
            }
        }

        let mut h = FileBlockHeader {
            first: flags & FILE_SPLIT_BEFORE == 0,
            last: flags & FILE_SPLIT_AFTER == 0,
            volnum,
            data_off,
            dec_ver: if method == b'0' { 0 } else { unp_ver },
            win_size,
            arc_solid: self.solid,
            hash: (!is_dir).then(|| (HashKind::Crc32, file_crc.to_le_bytes().to_vec())),
            key,
            iv,
            salt,
            kdf_count: if encrypted { KDF_ROUNDS } else { 0 },
            ..Default::default()
        };
        h.h.name = name;
        h.h.is_dir = is_dir;
        h.h.solid = flags & FILE_SOLID != 0;
        h.h.encrypted = encrypted;
        h.h.header_encrypted = self.encrypted;
        h.h.host_os = HostOs::from_rar15(host_os);
        h.h.attributes = attributes;
        h.h.packed_size = packed_size as i64;
        h.h.unpacked_size = if unknown_size { -1 } else { unpacked_size as i64 };
        h.h.unknown_size = unknown_size;
        h.h.modification_time = RawTimestamp::from_dos(dos_time);
        h.h.offset = data_off;
        h.h.volume_number = volnum;

        if flags & FILE_EXT_TIME != 0 {
            read_ext_times(&mut b, &mut h.h);
        }

        trace!(name = %h.h.name, packed = packed_size, first = h.first, last = h.last, "legacy file block");
        Ok(h)
    }
}

/// Extended-time record: per-timestamp 4-bit descriptors packing presence,
/// a one-second carry and 0-3 bytes of 100 ns precision.
fn read_ext_times(b: &mut SliceReader<'_>, h: &mut crate::header::FileHeader) {
    let Some(flags) = b.le16() else { return };
    // order: modification, creation, access, archive (last one discarded)
    for i in 0..4u16 {
        let n = (flags >> ((3 - i) * 4)) & 0x0f;
        if n & 0x8 == 0 {
            continue;
        }
        let mut t = if i == 0 {
            h.modification_time
        } else {
            match b.le32() {
                Some(dos) => RawTimestamp::from_dos(dos),
                None => return,
            }
        };
        if n & 0x4 != 0 {
            t = t.saturating_add(1_000_000_000);
        }
        let count = (n & 0x3) as usize;
        if count > 0 {
            let mut reminder: u32 = 0;
            for k in 0..count {
                let Some(byte) = b.byte() else { return };
                reminder |= (byte as u32) << ((k + 3 - count) * 8);
            }
            t = t.saturating_add(reminder as i64 * 100);
        }
        match i {
            0 => h.modification_time = t,
            1 => h.creation_time = t,
            2 => h.access_time = t,
            _ => {}
        }
    }
}

/// Decode a legacy file name, handling the optional compressed UTF-16
/// encoding appended after a NUL separator when the unicode flag is set.
fn decode_file_name(raw: &[u8], unicode: bool) -> String {
    let name = if !unicode {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        match raw.iter().position(|&c| c == 0) {
            // flag set but single name: already UTF-8
            None => String::from_utf8_lossy(raw).into_owned(),
            Some(p) => decode_unicode_name(&raw[..p], &raw[p + 1..]),
        }
    };
    name.replace('\\', "/")
}

/// RAR's compact unicode name encoding: 2-bit opcodes select a raw byte,
/// a byte combined with a shared high byte, a full UTF-16 unit, or a run
/// copied from the plain-name bytes.
fn decode_unicode_name(plain: &[u8], enc: &[u8]) -> String {
    if enc.is_empty() {
        return String::from_utf8_lossy(plain).into_owned();
    }
    let mut out: Vec<u16> = Vec::with_capacity(plain.len());
    let high_byte = (enc[0] as u16) << 8;
    let mut pos = 1;
    let mut flags = 0u16;
    let mut flag_bits = 0u32;
    while pos < enc.len() {
        if flag_bits == 0 {
            flags = enc[pos] as u16;
            flag_bits = 8;
            pos += 1;
            continue;
        }
        flag_bits -= 2;
        match (flags >> flag_bits) & 3 {
            0 => {
                if pos >= enc.len() {
                    break;
                }
                out.push(enc[pos] as u16);
                pos += 1;
            }
            1 => {
                if pos >= enc.len() {
                    break;
                }
                out.push(enc[pos] as u16 | high_byte);
                pos += 1;
            }
            2 => {
                if pos + 1 >= enc.len() {
                    break;
                }
                out.push(u16::from_le_bytes([enc[pos], enc[pos + 1]]));
                pos += 2;
            }
            _ => {
                if pos >= enc.len() {
                    break;
                }
                let length = enc[pos];
                pos += 1;
                if length & 0x80 != 0 {
                    if pos >= enc.len() {
                        break;
                    }
                    let correction = enc[pos] as u16;
                    pos += 1;
                    for _ in 0..(length & 0x7f) + 2 {
                        let Some(&c) = plain.get(out.len()) else { break };
                        out.push(((c as u16 + correction) & 0xff) | high_byte);
                    }
                } else {
                    for _ in 0..(length & 0x7f) + 2 {
                        let Some(&c) = plain.get(out.len()) else { break };
                        out.push(c as u16);
                    }
                }
            }
        }
    }
    String::from_utf16_lossy(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::tests::reader_over;

    /// Header CRC used by legacy blocks: low 16 bits of CRC-32.
    fn crc16(data: &[u8]) -> u16 {
        (crc32fast::hash(data) & 0xffff) as u16
    }

    /// Build a legacy file block for a stored file.
    fn build_file_block(name: &str, content: &[u8], flags: u16) -> Vec<u8> {
        let fname = name.as_bytes();
        let mut body = Vec::new();
        body.extend_from_slice(&(content.len() as u32).to_le_bytes()); // packed
        body.extend_from_slice(&(content.len() as u32).to_le_bytes()); // unpacked
        body.push(3); // host: unix
        body.extend_from_slice(&crc32fast::hash(content).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // dos time
        body.push(20); // unpack version
        body.push(b'0'); // method: store
        body.extend_from_slice(&(fname.len() as u16).to_le_bytes());
        body.extend_from_slice(&0o644u32.to_le_bytes()); // attributes
        body.extend_from_slice(fname);

        let size = (HEAD_SIZE + body.len()) as u16;
        let mut crc_input = vec![BLOCK_FILE];
        crc_input.extend_from_slice(&(flags | BLOCK_LONG).to_le_bytes());
        crc_input.extend_from_slice(&size.to_le_bytes());
        crc_input.extend_from_slice(&body);

        let mut out = Vec::new();
        out.extend_from_slice(&crc16(&crc_input).to_le_bytes());
        out.extend_from_slice(&crc_input);
        out.extend_from_slice(content);
        out
    }

    #[test]
    fn test_parse_stored_file_block() {
        let data = build_file_block("test.txt", b"hello", 0);
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        match a.next_block(&mut br, 0).unwrap() {
            NextBlock::File(h) => {
                assert_eq!(h.h.name, "test.txt");
                assert_eq!(h.h.packed_size, 5);
                assert_eq!(h.h.unpacked_size, 5);
                assert_eq!(h.dec_ver, 0);
                assert!(h.first && h.last);
                assert!(!h.h.is_dir);
                assert_eq!(h.h.host_os, HostOs::Unix);
                let (kind, sum) = h.hash.unwrap();
                assert_eq!(kind, HashKind::Crc32);
                assert_eq!(sum, crc32fast::hash(b"hello").to_le_bytes());
            }
            other => panic!("expected file block, got {other:?}"),
        }
    }

    #[test]
    fn test_split_flags() {
        let data = build_file_block("a.bin", b"xyz", FILE_SPLIT_BEFORE | FILE_SPLIT_AFTER);
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        match a.next_block(&mut br, 2).unwrap() {
            NextBlock::File(h) => {
                assert!(!h.first);
                assert!(!h.last);
                assert_eq!(h.volnum, 2);
            }
            other => panic!("expected file block, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_header_crc() {
        let mut data = build_file_block("test.txt", b"hello", 0);
        data[0] ^= 0xff; // corrupt the stored CRC
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        assert!(matches!(
            a.next_block(&mut br, 0),
            Err(RarError::BadHeaderCrc)
        ));
    }

    #[test]
    fn test_undersized_header_rejected() {
        // size field below the 7-byte minimum
        let mut crc_input = vec![BLOCK_FILE];
        crc_input.extend_from_slice(&0u16.to_le_bytes());
        crc_input.extend_from_slice(&3u16.to_le_bytes());
        let mut data = Vec::new();
        data.extend_from_slice(&crc16(&crc_input).to_le_bytes());
        data.extend_from_slice(&crc_input);
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        assert!(matches!(
            a.next_block(&mut br, 0),
            Err(RarError::CorruptBlockHeader)
        ));
    }

    #[test]
    fn test_end_of_volume_marker() {
        let mut crc_input = vec![BLOCK_END];
        crc_input.extend_from_slice(&END_NEXT_VOLUME.to_le_bytes());
        crc_input.extend_from_slice(&7u16.to_le_bytes());
        let mut data = Vec::new();
        data.extend_from_slice(&crc16(&crc_input).to_le_bytes());
        data.extend_from_slice(&crc_input);
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        assert!(matches!(
            a.next_block(&mut br, 0).unwrap(),
            NextBlock::EndOfVolume
        ));
    }

    #[test]
    fn test_eof_at_block_boundary_is_end_of_archive() {
        let mut br = reader_over(Vec::new());
        let mut a = Archive15::new(&Options::new());
        assert!(matches!(
            a.next_block(&mut br, 0).unwrap(),
            NextBlock::EndOfArchive
        ));
    }

    #[test]
    fn test_directory_block() {
        let data = build_file_block("somedir", b"", FILE_WINDOW_MASK);
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        match a.next_block(&mut br, 0).unwrap() {
            NextBlock::File(h) => {
                assert!(h.h.is_dir);
                assert_eq!(h.win_size, 0);
                assert!(h.hash.is_none());
            }
            other => panic!("expected file block, got {other:?}"),
        }
    }

    #[test]
    fn test_backslash_normalized() {
        let data = build_file_block("dir\\file.txt", b"x", 0);
        let mut br = reader_over(data);
        let mut a = Archive15::new(&Options::new());
        match a.next_block(&mut br, 0).unwrap() {
            NextBlock::File(h) => assert_eq!(h.h.name, "dir/file.txt"),
            other => panic!("expected file block, got {other:?}"),
        }
    }
}
