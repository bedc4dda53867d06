//! Buffered byte-level I/O over one physical volume.
//!
//! Wraps an arbitrary byte source with a fixed-size buffer and performs the
//! bounded signature scan that locates the archive inside a possible
//! self-extracting stub.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use crate::error::{RarError, Result};
use crate::format::Signature;
use crate::options::DEFAULT_SFX_WINDOW;

pub(crate) const DEFAULT_BUF_SIZE: usize = 4096;

/// A byte source backing one volume. Seeking is optional; sources that
/// support it enable random access and concurrent opens.
pub(crate) trait ByteSource: Read + Send {
    fn can_seek(&self) -> bool {
        false
    }

    fn seek_to(&mut self, _pos: u64) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "source does not support seeking",
        ))
    }
}

impl ByteSource for fs::File {
    fn can_seek(&self) -> bool {
        true
    }

    fn seek_to(&mut self, pos: u64) -> io::Result<u64> {
        self.seek(SeekFrom::Start(pos))
    }
}

/// Adapter granting [`ByteSource`] seek support to any `Read + Seek` value.
pub(crate) struct SeekSource<R>(pub R);

impl<R: Read + Send> Read for SeekSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Seek + Send> ByteSource for SeekSource<R> {
    fn can_seek(&self) -> bool {
        true
    }

    fn seek_to(&mut self, pos: u64) -> io::Result<u64> {
        self.0.seek(SeekFrom::Start(pos))
    }
}

/// Adapter for plain forward-only streams.
pub(crate) struct StreamSource<R>(pub R);

impl<R: Read + Send> Read for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Send> ByteSource for StreamSource<R> {}

/// Buffered reader over one volume with absolute-offset tracking.
pub(crate) struct BufVolumeReader {
    src: Box<dyn ByteSource>,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    /// Absolute offset of the next byte to be delivered.
    off: u64,
    eof: bool,
}

impl std::fmt::Debug for BufVolumeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufVolumeReader")
            .field("pos", &self.pos)
            .field("len", &self.len)
            .field("off", &self.off)
            .field("eof", &self.eof)
            .finish()
    }
}

impl BufVolumeReader {
    pub(crate) fn new(src: Box<dyn ByteSource>) -> Self {
        BufVolumeReader {
            src,
            buf: vec![0u8; DEFAULT_BUF_SIZE],
            pos: 0,
            len: 0,
            off: 0,
            eof: false,
        }
    }

    pub(crate) fn can_seek(&self) -> bool {
        self.src.can_seek()
    }

    /// Absolute offset of the next byte.
    pub(crate) fn offset(&self) -> u64 {
        self.off
    }

    fn buffered(&self) -> usize {
        self.len - self.pos
    }

    /// Compact the buffer and read until at least `n` bytes are buffered
    /// or the source is exhausted. Returns the buffered count.
    fn fill_at_least(&mut self, n: usize) -> io::Result<usize> {
        debug_assert!(n <= self.buf.len());
        if self.buffered() >= n {
            return Ok(self.buffered());
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.len, 0);
            self.len -= self.pos;
            self.pos = 0;
        }
        while self.len < n && !self.eof {
            let read = self.src.read(&mut self.buf[self.len..])?;
            if read == 0 {
                self.eof = true;
                break;
            }
            self.len += read;
        }
        Ok(self.buffered())
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.pos += n;
        self.off += n as u64;
    }

    /// Read up to `p.len()` bytes; `Ok(0)` means end of volume.
    pub(crate) fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }
        if self.buffered() == 0 {
            // large reads bypass the buffer
            if p.len() >= self.buf.len() {
                if self.eof {
                    return Ok(0);
                }
                let n = self.src.read(p)?;
                if n == 0 {
                    self.eof = true;
                }
                self.off += n as u64;
                return Ok(n);
            }
            if self.fill_at_least(1)? == 0 {
                return Ok(0);
            }
        }
        let n = p.len().min(self.buffered());
        p[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.consume(n);
        Ok(n)
    }

    /// Read one byte; `Ok(None)` means end of volume.
    pub(crate) fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.buffered() == 0 && self.fill_at_least(1)? == 0 {
            return Ok(None);
        }
        let b = self.buf[self.pos];
        self.consume(1);
        Ok(Some(b))
    }

    /// Look at the next `n` bytes (at most the buffer size) without
    /// consuming them; fewer are returned at end of volume.
    pub(crate) fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let avail = self.fill_at_least(n.min(self.buf.len()))?;
        Ok(&self.buf[self.pos..self.pos + avail.min(n)])
    }

    /// Read exactly `n` bytes into a fresh buffer.
    ///
    /// A short source surfaces [`io::ErrorKind::UnexpectedEof`], which
    /// header parsers translate to their own truncation errors.
    pub(crate) fn read_exact_vec(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.read(&mut out[filled..])?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += read;
        }
        Ok(out)
    }

    /// Skip `n` bytes, seeking past them when the source allows it.
    pub(crate) fn discard(&mut self, n: u64) -> io::Result<()> {
        let from_buf = (self.buffered() as u64).min(n);
        self.consume(from_buf as usize);
        let mut left = n - from_buf;
        if left == 0 {
            return Ok(());
        }
        if self.can_seek() {
            return self.seek_to(self.off + left);
        }
        let mut scratch = [0u8; 512];
        while left > 0 {
            let want = (scratch.len() as u64).min(left) as usize;
            let read = self.read(&mut scratch[..want])?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            left -= read as u64;
        }
        Ok(())
    }

    /// Reposition to an absolute volume offset. Requires a seekable source.
    pub(crate) fn seek_to(&mut self, abs: u64) -> io::Result<()> {
        // serve from the buffer when the target is inside it
        let window_start = self.off;
        let window_end = self.off + self.buffered() as u64;
        if abs >= window_start && abs < window_end {
            self.consume((abs - window_start) as usize);
            return Ok(());
        }
        self.src.seek_to(abs)?;
        self.pos = 0;
        self.len = 0;
        self.off = abs;
        self.eof = false;
        Ok(())
    }

    /// Scan the leading bytes for a RAR signature.
    ///
    /// The scan is progressive and bounded: a signature must begin within
    /// the first `max_sfx` bytes or the reader fails with
    /// [`RarError::NoSignature`]. On success the pre-signature bytes (the
    /// SFX stub) and the signature itself have been consumed.
    pub(crate) fn find_signature(&mut self, max_sfx: u64) -> Result<Signature> {
        const PREFIX: &[u8; 6] = Signature::PREFIX;
        enum Scan {
            Found15(usize),
            Found50(usize),
            /// Candidate needs lookahead past the window; refill and retry.
            Refill(usize),
            /// No candidate in the window; safe to advance by this much.
            Advance(usize),
        }
        let base = self.off;
        loop {
            self.fill_at_least(self.buf.len())?;
            if self.buffered() < PREFIX.len() + 1 {
                return Err(RarError::NoSignature);
            }
            let eof = self.eof;
            // offset of the window start within the scan
            let rel = self.off - base;
            let scan = {
                let window = &self.buf[self.pos..self.len];
                let mut res = Scan::Advance(window.len().saturating_sub(Signature::RAR50.len() - 1));
                let mut i = 0;
                while i + PREFIX.len() <= window.len() {
                    if rel + i as u64 > max_sfx {
                        return Err(RarError::NoSignature);
                    }
                    if !window[i..].starts_with(PREFIX) {
                        i += 1;
                        continue;
                    }
                    match window.get(i + 6).copied() {
                        Some(0x00) => {
                            res = Scan::Found15(i);
                            break;
                        }
                        Some(0x01) => match window.get(i + 7).copied() {
                            Some(0x00) => {
                                res = Scan::Found50(i);
                                break;
                            }
                            Some(_) => i += 1,
                            None if !eof => {
                                res = Scan::Refill(i);
                                break;
                            }
                            None => i += 1,
                        },
                        Some(_) => i += 1,
                        None if !eof => {
                            res = Scan::Refill(i);
                            break;
                        }
                        None => i += 1,
                    }
                }
                res
            };
            match scan {
                Scan::Found15(i) => {
                    self.consume(i + 7);
                    debug!(sfx_len = self.off - base - 7, "found RAR 1.5 signature");
                    return Ok(Signature::Rar15);
                }
                Scan::Found50(i) => {
                    self.consume(i + 8);
                    debug!(sfx_len = self.off - base - 8, "found RAR 5.0 signature");
                    return Ok(Signature::Rar50);
                }
                Scan::Refill(i) => self.consume(i),
                Scan::Advance(keep) => {
                    if eof {
                        return Err(RarError::NoSignature);
                    }
                    self.consume(keep);
                }
            }
            if self.off - base > max_sfx {
                return Err(RarError::NoSignature);
            }
        }
    }

    /// Convenience constructor scanning the default SFX window.
    pub(crate) fn with_signature(src: Box<dyn ByteSource>) -> Result<(Self, Signature)> {
        let mut br = BufVolumeReader::new(src);
        let sig = br.find_signature(DEFAULT_SFX_WINDOW)?;
        Ok((br, sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: Vec<u8>) -> BufVolumeReader {
        BufVolumeReader::new(Box::new(SeekSource(Cursor::new(data))))
    }

    #[test]
    fn test_find_sig_plain_text() {
        let mut br = reader(b"This is not a RAR file, just some plain text content.".to_vec());
        assert!(matches!(
            br.find_signature(DEFAULT_SFX_WINDOW),
            Err(RarError::NoSignature)
        ));
    }

    #[test]
    fn test_find_sig_empty() {
        let mut br = reader(Vec::new());
        assert!(matches!(
            br.find_signature(DEFAULT_SFX_WINDOW),
            Err(RarError::NoSignature)
        ));
    }

    #[test]
    fn test_find_sig_partial_prefix() {
        let mut br = reader(b"Rar!XXXX this has Rar! but not the correct signature".to_vec());
        assert!(matches!(
            br.find_signature(DEFAULT_SFX_WINDOW),
            Err(RarError::NoSignature)
        ));
    }

    #[test]
    fn test_find_sig_large_without_signature() {
        let data = b"Not a RAR file content. ".repeat(10_000); // ~240 KiB
        let mut br = reader(data);
        assert!(matches!(
            br.find_signature(DEFAULT_SFX_WINDOW),
            Err(RarError::NoSignature)
        ));
    }

    #[test]
    fn test_find_sig_rar50() {
        let mut br = reader(b"Rar!\x1a\x07\x01\x00rest".to_vec());
        assert_eq!(br.find_signature(DEFAULT_SFX_WINDOW).unwrap(), Signature::Rar50);
        assert_eq!(br.offset(), 8);
    }

    #[test]
    fn test_find_sig_rar15() {
        let mut br = reader(b"Rar!\x1a\x07\x00rest".to_vec());
        assert_eq!(br.find_signature(DEFAULT_SFX_WINDOW).unwrap(), Signature::Rar15);
        assert_eq!(br.offset(), 7);
    }

    #[test]
    fn test_find_sig_with_sfx_prefix() {
        let mut data = vec![b'X'; 1000];
        data.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
        let mut br = reader(data);
        assert_eq!(br.find_signature(DEFAULT_SFX_WINDOW).unwrap(), Signature::Rar50);
        assert_eq!(br.offset(), 1008);
    }

    #[test]
    fn test_find_sig_prefix_straddles_buffer_boundary() {
        // place the signature so it crosses the 4096-byte refill boundary
        let mut data = vec![b'X'; DEFAULT_BUF_SIZE - 3];
        data.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
        let mut br = reader(data);
        assert_eq!(br.find_signature(DEFAULT_SFX_WINDOW).unwrap(), Signature::Rar50);
    }

    #[test]
    fn test_find_sig_within_window_limit() {
        let mut data = vec![b'X'; (DEFAULT_SFX_WINDOW - 100) as usize];
        data.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
        let mut br = reader(data);
        assert!(br.find_signature(DEFAULT_SFX_WINDOW).is_ok());
    }

    #[test]
    fn test_find_sig_beyond_window_limit() {
        let mut data = vec![b'X'; (DEFAULT_SFX_WINDOW + 1) as usize];
        data.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
        let mut br = reader(data);
        assert!(matches!(
            br.find_signature(DEFAULT_SFX_WINDOW),
            Err(RarError::NoSignature)
        ));
    }

    #[test]
    fn test_find_sig_incomplete_at_eof() {
        let mut br = reader(b"Some content and then Rar!\x1a".to_vec());
        assert!(matches!(
            br.find_signature(DEFAULT_SFX_WINDOW),
            Err(RarError::NoSignature)
        ));
    }

    #[test]
    fn test_read_after_signature() {
        let mut br = reader(b"Rar!\x1a\x07\x01\x00Test content after signature".to_vec());
        br.find_signature(DEFAULT_SFX_WINDOW).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(br.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"Test");
    }

    #[test]
    fn test_read_byte() {
        let mut br = reader(b"Rar!\x1a\x07\x01\x00ABC".to_vec());
        br.find_signature(DEFAULT_SFX_WINDOW).unwrap();
        assert_eq!(br.read_byte().unwrap(), Some(b'A'));
        assert_eq!(br.read_byte().unwrap(), Some(b'B'));
        assert_eq!(br.read_byte().unwrap(), Some(b'C'));
        assert_eq!(br.read_byte().unwrap(), None);
    }

    #[test]
    fn test_discard() {
        let mut data = b"Rar!\x1a\x07\x01\x00".to_vec();
        data.extend(std::iter::repeat(b'X').take(1000));
        let mut br = reader(data);
        br.find_signature(DEFAULT_SFX_WINDOW).unwrap();
        br.discard(100).unwrap();
        assert_eq!(br.offset(), 108);
        assert_eq!(br.read_byte().unwrap(), Some(b'X'));
    }

    #[test]
    fn test_seek_round_trip() {
        let mut data = b"Rar!\x1a\x07\x01\x00".to_vec();
        data.extend_from_slice(&b"ABCD".repeat(100));
        let expected = data[10];
        let mut br = reader(data);
        br.find_signature(DEFAULT_SFX_WINDOW).unwrap();
        assert!(br.can_seek());
        br.seek_to(10).unwrap();
        assert_eq!(br.read_byte().unwrap(), Some(expected));
        // backwards past the buffer window
        br.seek_to(8).unwrap();
        assert_eq!(br.read_byte().unwrap(), Some(b'A'));
    }

    #[test]
    fn test_read_exact_vec_short_source() {
        let mut br = reader(b"abc".to_vec());
        let err = br.read_exact_vec(10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
