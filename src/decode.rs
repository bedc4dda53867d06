//! The decode stack: decryption, decompression, length limiting and
//! checksum verification composed over the packed byte stream.
//!
//! The stack is assembled once per opened file. Reads flow bottom-up:
//! packed source → AES-CBC decryption → (decompressor) → length limit →
//! checksum verifier. A file that is encrypted without a derived key gets
//! an error source that fails every read instead.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::blocklist::FileBlockList;
use crate::crypto::rar50::{fold_to_crc32, hmac_sum};
use crate::crypto::{CbcCipher, AES_BLOCK_SIZE};
use crate::decompress::{self, DecoderParams};
use crate::error::{RarError, Result};
use crate::header::{FileBlockHeader, FileHeader, HashKind, DECODE_STORED};
use crate::options::Options;
use crate::packed::PackedFileReader;
use crate::volume::VolumeManager;

const DECRYPT_CHUNK: usize = 4096;

/// Streaming AES-CBC decryption over the packed source.
///
/// The CBC chain runs across the whole stitched packed stream, so
/// multi-volume files decrypt continuously. Seeking re-keys the cipher
/// with the preceding ciphertext block as IV.
#[derive(Debug)]
struct Decrypter {
    key: Vec<u8>,
    file_iv: Vec<u8>,
    cipher: CbcCipher,
    buf: Vec<u8>,
    pos: usize,
}

impl Decrypter {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Decrypter {
            cipher: CbcCipher::for_key(key, iv)?,
            key: key.to_vec(),
            file_iv: iv.to_vec(),
            buf: Vec::new(),
            pos: 0,
        })
    }

    fn read(&mut self, pr: &mut PackedFileReader, p: &mut [u8]) -> Result<usize> {
        if self.pos == self.buf.len() {
            let mut raw = vec![0u8; DECRYPT_CHUNK];
            let mut filled = 0;
            while filled < raw.len() {
                let n = pr.read(&mut raw[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            // a trailing partial cipher block cannot be decrypted
            let whole = filled - filled % AES_BLOCK_SIZE;
            if whole == 0 {
                return Ok(0);
            }
            raw.truncate(whole);
            self.cipher.decrypt_blocks(&mut raw)?;
            self.buf = raw;
            self.pos = 0;
        }
        let n = p.len().min(self.buf.len() - self.pos);
        p[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Reposition so the next read delivers plaintext at `target`.
    fn seek(&mut self, pr: &mut PackedFileReader, target: u64) -> Result<()> {
        let block = target / AES_BLOCK_SIZE as u64;
        let iv = if block == 0 {
            self.file_iv.clone()
        } else {
            // CBC: the IV of block k is the ciphertext of block k-1
            pr.seek_packed((block - 1) * AES_BLOCK_SIZE as u64)?;
            let mut prev = [0u8; AES_BLOCK_SIZE];
            let mut filled = 0;
            while filled < prev.len() {
                let n = pr.read(&mut prev[filled..])?;
                if n == 0 {
                    return Err(RarError::Invalid);
                }
                filled += n;
            }
            prev.to_vec()
        };
        if block == 0 {
            pr.seek_packed(0)?;
        }
        self.cipher = CbcCipher::for_key(&self.key, &iv)?;
        self.buf.clear();
        self.pos = 0;
        // discard the intra-block remainder
        let mut skip = (target % AES_BLOCK_SIZE as u64) as usize;
        let mut scratch = [0u8; AES_BLOCK_SIZE];
        while skip > 0 {
            let n = self.read(pr, &mut scratch[..skip])?;
            if n == 0 {
                return Err(RarError::Invalid);
            }
            skip -= n;
        }
        Ok(())
    }
}

/// Truncates the decoded stream to the declared unpacked size, so decoder
/// or cipher padding never reaches the consumer.
#[derive(Debug)]
struct Limiter {
    size: u64,
    offset: u64,
}

#[derive(Debug)]
enum HashState {
    Crc32(crc32fast::Hasher),
    Blake2sp(Box<blake2s_simd::blake2sp::State>),
}

/// Streams decoded bytes through the hash function and verifies the
/// stored digest at end of stream.
#[derive(Debug)]
struct ChecksumVerifier {
    state: HashState,
    /// Digest and key from the first block; the final block's values are
    /// preferred at verification time (split files store the file digest
    /// in their last part).
    expected: (HashKind, Vec<u8>),
    hash_key: Vec<u8>,
    outcome: Option<bool>,
}

impl ChecksumVerifier {
    fn new(expected: (HashKind, Vec<u8>), hash_key: Vec<u8>) -> Self {
        let state = match expected.0 {
            HashKind::Crc32 => HashState::Crc32(crc32fast::Hasher::new()),
            HashKind::Blake2sp => {
                HashState::Blake2sp(Box::new(blake2s_simd::blake2sp::State::new()))
            }
        };
        ChecksumVerifier {
            state,
            expected,
            hash_key,
            outcome: None,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HashState::Crc32(h) => h.update(data),
            HashState::Blake2sp(s) => {
                s.update(data);
            }
        }
    }

    /// Verify at end of stream; idempotent once decided.
    fn finalize(
        &mut self,
        current: Option<&Arc<FileBlockHeader>>,
        blocks: &Arc<FileBlockList>,
    ) -> Result<()> {
        if let Some(ok) = self.outcome {
            return if ok { Ok(()) } else { Err(RarError::BadFileChecksum) };
        }
        let digest: Vec<u8> = match &mut self.state {
            HashState::Crc32(h) => h.clone().finalize().to_le_bytes().to_vec(),
            HashState::Blake2sp(s) => s.finalize().as_bytes().to_vec(),
        };
        let (stored, hash_key) = match current.and_then(|h| h.hash.as_ref()) {
            Some((_, sum)) => (
                sum.clone(),
                current.map(|h| h.hash_key.clone()).unwrap_or_default(),
            ),
            None => (self.expected.1.clone(), self.hash_key.clone()),
        };
        let computed = if !hash_key.is_empty() {
            let mac = hmac_sum(&hash_key, &digest);
            if stored.len() == 4 {
                fold_to_crc32(&mac).to_vec()
            } else {
                mac.to_vec()
            }
        } else {
            digest
        };
        let ok = computed == stored;
        self.outcome = Some(ok);
        if ok {
            // verified once, trusted thereafter
            blocks.remove_file_hash();
            trace!("file checksum verified");
            Ok(())
        } else {
            Err(RarError::BadFileChecksum)
        }
    }
}

/// Decode stack for one opened file.
#[derive(Debug)]
pub(crate) struct FileDecoder {
    /// Set when the file is encrypted but no key could be derived; every
    /// read fails with [`RarError::ArchivedFileEncrypted`].
    encrypted_no_key: bool,
    decrypt: Option<Decrypter>,
    limit: Option<Limiter>,
    checksum: Option<ChecksumVerifier>,
    blocks: Arc<FileBlockList>,
}

impl FileDecoder {
    pub(crate) fn new(blocks: &Arc<FileBlockList>, options: &Options) -> Result<Self> {
        let h = blocks.first_block();

        let mut encrypted_no_key = false;
        let decrypt = if h.h.encrypted {
            match &h.key {
                Some(key) => Some(Decrypter::new(key, &h.iv)?),
                None => {
                    encrypted_no_key = true;
                    None
                }
            }
        } else {
            None
        };

        if h.dec_ver > DECODE_STORED {
            decompress::init(DecoderParams {
                version: h.dec_ver,
                win_size: h.win_size,
                reset: !h.h.solid,
                arc_solid: h.arc_solid,
                unpacked_size: h.h.unpacked_size,
            })?;
        }

        let limit = (h.h.unpacked_size >= 0 && !h.h.unknown_size).then(|| Limiter {
            size: h.h.unpacked_size as u64,
            offset: 0,
        });

        let skip_check = options.skip_check && !options.open_check;
        let checksum = match (&h.hash, skip_check) {
            (Some(hash), false) => Some(ChecksumVerifier::new(hash.clone(), h.hash_key.clone())),
            _ => None,
        };

        debug!(
            name = %h.h.name,
            encrypted = h.h.encrypted,
            limited = limit.is_some(),
            checked = checksum.is_some(),
            "decode stack assembled"
        );
        Ok(FileDecoder {
            encrypted_no_key,
            decrypt,
            limit,
            checksum,
            blocks: blocks.clone(),
        })
    }

    pub(crate) fn is_seek_transparent(&self) -> bool {
        !self.encrypted_no_key && self.checksum.is_none()
    }

    fn read_inner(&mut self, pr: &mut PackedFileReader, p: &mut [u8]) -> Result<usize> {
        match &mut self.decrypt {
            Some(d) => d.read(pr, p),
            None => pr.read(p),
        }
    }

    fn finish(&mut self, pr: &PackedFileReader) -> Result<()> {
        if let Some(c) = &mut self.checksum {
            c.finalize(pr.current(), &self.blocks)?;
        }
        Ok(())
    }

    /// Read decoded bytes; `Ok(0)` is end of file. The terminal read
    /// surfaces `ShortFile` or `BadFileChecksum` when applicable.
    pub(crate) fn read(&mut self, pr: &mut PackedFileReader, p: &mut [u8]) -> Result<usize> {
        if self.encrypted_no_key {
            return Err(RarError::ArchivedFileEncrypted);
        }
        if p.is_empty() {
            return Ok(0);
        }
        let remaining = self.limit.as_ref().map(|l| l.size - l.offset);
        if remaining == Some(0) {
            self.finish(pr)?;
            return Ok(0);
        }
        let cap = match remaining {
            Some(diff) => p.len().min(diff.min(usize::MAX as u64) as usize),
            None => p.len(),
        };
        let n = self.read_inner(pr, &mut p[..cap])?;
        if n == 0 {
            if let Some(l) = &self.limit {
                if l.offset < l.size {
                    return Err(RarError::ShortFile);
                }
            }
            self.finish(pr)?;
            return Ok(0);
        }
        if let Some(l) = &mut self.limit {
            l.offset += n as u64;
        }
        if let Some(c) = &mut self.checksum {
            c.update(&p[..n]);
        }
        Ok(n)
    }

    /// Reposition the decoded stream (stored files only; the caller has
    /// verified there is no decompressor in the stack).
    fn seek(&mut self, pr: &mut PackedFileReader, target: u64) -> Result<()> {
        match &mut self.decrypt {
            Some(d) => d.seek(pr, target)?,
            None => {
                pr.seek_packed(target)?;
            }
        }
        if let Some(l) = &mut self.limit {
            l.offset = target;
        }
        Ok(())
    }
}

/// An opened file inside the archive: the packed reader plus its decode
/// stack. Implements [`io::Read`], and [`io::Seek`] for stored files on
/// seekable sources once no checksum layer is active.
pub struct ArchiveFile {
    pr: PackedFileReader,
    dec: FileDecoder,
    blocks: Arc<FileBlockList>,
    pos: u64,
}

impl ArchiveFile {
    /// Open a file for random access through its block list, driving a
    /// fresh volume cursor.
    pub(crate) fn open(vm: &Arc<VolumeManager>, blocks: &Arc<FileBlockList>) -> Result<Self> {
        let h = blocks.first_block();
        if h.h.solid {
            return Err(RarError::SolidOpen);
        }
        let vol = vm.open_cursor(h.volnum)?;
        let mut pr = PackedFileReader::new(vol);
        pr.init(blocks.clone());
        pr.open_block(h, 0)?;
        let dec = FileDecoder::new(blocks, vm.options())?;
        Ok(ArchiveFile {
            pr,
            dec,
            blocks: blocks.clone(),
            pos: 0,
        })
    }

    /// Metadata of the opened file.
    pub fn header(&self) -> FileHeader {
        let first = self.blocks.first_block();
        let mut h = first.h.clone();
        h.part_number = first.blocknum;
        h.total_parts = self.blocks.len();
        h
    }

    /// True when this handle supports seeking: seekable volumes, stored
    /// data, and no pending checksum verification.
    pub fn is_seekable(&self) -> bool {
        self.pr.can_seek()
            && self.blocks.first_block().dec_ver == DECODE_STORED
            && self.dec.is_seek_transparent()
    }

    fn decoded_size(&mut self) -> Result<u64> {
        let h = self.blocks.first_block();
        if h.h.unpacked_size >= 0 && !h.h.unknown_size {
            return Ok(h.h.unpacked_size as u64);
        }
        // stored files without a declared size span their packed bytes
        self.pr.packed_size()
    }
}

impl Read for ArchiveFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.dec.read(&mut self.pr, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ArchiveFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if !self.pr.can_seek() {
            return Err(RarError::MultiVolume.into());
        }
        if !self.is_seekable() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file stream does not support seeking",
            ));
        }
        let target = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.decoded_size()?.checked_add_signed(d),
        };
        let target = target.ok_or(RarError::Invalid)?;
        if target > self.decoded_size()? {
            return Err(RarError::Invalid.into());
        }
        self.dec.seek(&mut self.pr, target)?;
        self.pos = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FileBlockHeader;

    fn stored_block(packed: i64, unpacked: i64) -> FileBlockHeader {
        let mut b = FileBlockHeader {
            first: true,
            last: true,
            ..Default::default()
        };
        b.h.name = "f".to_string();
        b.h.packed_size = packed;
        b.h.unpacked_size = unpacked;
        b
    }

    #[test]
    fn test_decoder_rejects_compressed_versions() {
        let mut b = stored_block(10, 10);
        b.dec_ver = 29;
        let blocks = FileBlockList::new(b);
        assert!(matches!(
            FileDecoder::new(&blocks, &Options::new()),
            Err(RarError::UnsupportedDecoder(29))
        ));
    }

    #[test]
    fn test_encrypted_without_key_builds_error_source() {
        let mut b = stored_block(16, 10);
        b.h.encrypted = true;
        let blocks = FileBlockList::new(b);
        let dec = FileDecoder::new(&blocks, &Options::new()).unwrap();
        assert!(dec.encrypted_no_key);
        assert!(!dec.is_seek_transparent());
    }

    #[test]
    fn test_limiter_only_when_size_known() {
        let blocks = FileBlockList::new(stored_block(10, 10));
        let dec = FileDecoder::new(&blocks, &Options::new()).unwrap();
        assert!(dec.limit.is_some());

        let mut unknown = stored_block(10, -1);
        unknown.h.unknown_size = true;
        let blocks = FileBlockList::new(unknown);
        let dec = FileDecoder::new(&blocks, &Options::new()).unwrap();
        assert!(dec.limit.is_none());
    }

    #[test]
    fn test_checksum_layer_respects_skip_check() {
        let mut b = stored_block(10, 10);
        b.hash = Some((HashKind::Crc32, vec![0; 4]));
        let blocks = FileBlockList::new(b);

        let dec = FileDecoder::new(&blocks, &Options::new()).unwrap();
        assert!(dec.checksum.is_some());

        let dec = FileDecoder::new(&blocks, &Options::new().skip_check(true)).unwrap();
        assert!(dec.checksum.is_none());

        // open_check re-enables verification
        let dec =
            FileDecoder::new(&blocks, &Options::new().skip_check(true).open_check(true)).unwrap();
        assert!(dec.checksum.is_some());
    }

    #[test]
    fn test_checksum_verifier_crc32() {
        let blocks = FileBlockList::new(stored_block(14, 14));
        let mut v = ChecksumVerifier::new(
            (HashKind::Crc32, 0xD6FD5D76u32.to_le_bytes().to_vec()),
            Vec::new(),
        );
        v.update(b"Hello, World!\n");
        assert!(v.finalize(None, &blocks).is_ok());
        // idempotent
        assert!(v.finalize(None, &blocks).is_ok());
    }

    #[test]
    fn test_checksum_verifier_mismatch_sticks() {
        let blocks = FileBlockList::new(stored_block(14, 14));
        let mut v = ChecksumVerifier::new(
            (HashKind::Crc32, 0xD6FD5D76u32.to_le_bytes().to_vec()),
            Vec::new(),
        );
        v.update(b"Hello, World?\n"); // one byte off
        assert!(matches!(
            v.finalize(None, &blocks),
            Err(RarError::BadFileChecksum)
        ));
        assert!(matches!(
            v.finalize(None, &blocks),
            Err(RarError::BadFileChecksum)
        ));
    }

    #[test]
    fn test_checksum_verifier_blake2sp() {
        let blocks = FileBlockList::new(stored_block(3, 3));
        let expected = blake2s_simd::blake2sp::blake2sp(b"abc");
        let mut v = ChecksumVerifier::new(
            (HashKind::Blake2sp, expected.as_bytes().to_vec()),
            Vec::new(),
        );
        v.update(b"a");
        v.update(b"bc");
        assert!(v.finalize(None, &blocks).is_ok());
    }

    #[test]
    fn test_keyed_checksum_folding() {
        let key = [7u8; 32];
        let digest = crc32fast::hash(b"data").to_le_bytes();
        let mac = hmac_sum(&key, &digest);
        let folded = fold_to_crc32(&mac);

        let mut b = stored_block(4, 4);
        b.hash = Some((HashKind::Crc32, folded.to_vec()));
        b.hash_key = key.to_vec();
        let blocks = FileBlockList::new(b.clone());

        let mut v = ChecksumVerifier::new((HashKind::Crc32, folded.to_vec()), key.to_vec());
        v.update(b"data");
        assert!(v.finalize(Some(&Arc::new(b)), &blocks).is_ok());
    }
}
