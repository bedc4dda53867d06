//! Version-specific block-header decoding behind one interface.
//!
//! The two archive generations frame blocks differently but both reduce
//! to the same stream of file blocks interleaved with bookkeeping blocks;
//! [`BlockParser::next_block`] hides the difference from the volume layer.

pub(crate) mod rar15;
pub(crate) mod rar50;
pub(crate) mod vint;

use std::io;

use crate::bufio::BufVolumeReader;
use crate::error::{RarError, Result};
use crate::format::Signature;
use crate::header::FileBlockHeader;
use crate::options::Options;

/// Largest accepted block-header size; anything above is hostile input.
pub(crate) const MAX_HEADER_SIZE: u64 = 1 << 20;

/// Outcome of advancing the block parser.
#[derive(Debug)]
pub(crate) enum NextBlock {
    /// A file (or file continuation) block; its packed data follows.
    File(FileBlockHeader),
    /// End-of-archive marker with the next-volume bit set.
    EndOfVolume,
    /// The archive is complete.
    EndOfArchive,
}

/// Version dispatch for the two header formats.
///
/// Cloning captures the archive-level state (flags, header-encryption
/// keys, derived-key cache) so fresh volume cursors can resume parsing
/// mid-archive.
#[derive(Clone, Debug)]
pub(crate) enum BlockParser {
    Rar15(rar15::Archive15),
    Rar50(rar50::Archive50),
}

impl BlockParser {
    pub(crate) fn new(sig: Signature, options: &Options) -> Self {
        match sig {
            Signature::Rar15 => BlockParser::Rar15(rar15::Archive15::new(options)),
            Signature::Rar50 => BlockParser::Rar50(rar50::Archive50::new(options)),
        }
    }

    pub(crate) fn signature(&self) -> Signature {
        match self {
            BlockParser::Rar15(_) => Signature::Rar15,
            BlockParser::Rar50(_) => Signature::Rar50,
        }
    }

    /// Decode block headers until the next file block, end-of-volume or
    /// end-of-archive. Non-file blocks (main, encryption, service,
    /// comment) are consumed internally, including their data areas.
    pub(crate) fn next_block(
        &mut self,
        br: &mut BufVolumeReader,
        volnum: usize,
    ) -> Result<NextBlock> {
        match self {
            BlockParser::Rar15(a) => a.next_block(br, volnum),
            BlockParser::Rar50(a) => a.next_block(br, volnum),
        }
    }

    /// True when the archive main header declared more volumes.
    pub(crate) fn is_multi_volume(&self) -> bool {
        match self {
            BlockParser::Rar15(a) => a.multi,
            BlockParser::Rar50(a) => a.multi,
        }
    }

    /// True when legacy pre-RAR3 volume naming (`.r00`, not `.partN.rar`)
    /// was declared by the main header.
    pub(crate) fn legacy_naming(&self) -> bool {
        match self {
            BlockParser::Rar15(a) => a.old_naming,
            BlockParser::Rar50(_) => false,
        }
    }

    /// Drop per-volume state when crossing into the next volume; each
    /// volume redeclares header encryption after its own signature.
    pub(crate) fn reset_volume(&mut self) {
        match self {
            BlockParser::Rar15(a) => a.reset_volume(),
            BlockParser::Rar50(a) => a.reset_volume(),
        }
    }
}

/// Map mid-header I/O failures: a clean EOF means the header was cut off.
pub(crate) fn truncated(e: io::Error) -> RarError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RarError::UnexpectedArchiveEnd
    } else {
        RarError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufio::{SeekSource, StreamSource};
    use std::io::Cursor;

    pub(crate) fn reader_over(data: Vec<u8>) -> BufVolumeReader {
        BufVolumeReader::new(Box::new(SeekSource(Cursor::new(data))))
    }

    #[test]
    fn test_parser_dispatch() {
        let opts = Options::new();
        assert_eq!(
            BlockParser::new(Signature::Rar15, &opts).signature(),
            Signature::Rar15
        );
        assert_eq!(
            BlockParser::new(Signature::Rar50, &opts).signature(),
            Signature::Rar50
        );
    }

    #[test]
    fn test_truncated_mapping() {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(truncated(eof), RarError::UnexpectedArchiveEnd));
        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(truncated(other), RarError::Io(_)));
    }

    #[test]
    fn test_stream_source_cannot_seek() {
        let br = BufVolumeReader::new(Box::new(StreamSource(Cursor::new(Vec::new()))));
        assert!(!br.can_seek());
    }
}
