//! File headers: the public per-file metadata and the internal
//! per-block bookkeeping used for multi-volume stitching.

use crate::format::{FileMode, HostOs, RawTimestamp};

/// Decode version of a stored (uncompressed) block.
pub(crate) const DECODE_STORED: u8 = 0;
/// Decode version of RAR 2.9-4.x compressed blocks.
pub(crate) const DECODE_29: u8 = 29;
/// Decode version of RAR 5.0 compressed blocks.
pub(crate) const DECODE_50: u8 = 50;

/// Checksum algorithm carried by a file block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashKind {
    /// CRC-32 (IEEE), 4-byte digest. Both formats.
    Crc32,
    /// BLAKE2sp, 32-byte digest. RAR 5 only.
    Blake2sp,
}

/// Metadata for a single file in a RAR archive.
#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    /// File name using `/` as the directory separator.
    pub name: String,
    /// Entry is a directory.
    pub is_dir: bool,
    /// Decoder state depends on preceding files in the archive.
    pub solid: bool,
    /// File contents are encrypted.
    pub encrypted: bool,
    /// File header was stored encrypted.
    pub header_encrypted: bool,
    /// Host OS the archive was created on.
    pub host_os: HostOs,
    /// Host-OS specific attribute bits.
    pub attributes: u64,
    /// Packed size of the first block (or the whole file if unsplit).
    pub packed_size: i64,
    /// Unpacked file size; -1 when unknown.
    pub unpacked_size: i64,
    /// Unpacked size was not recorded in the archive.
    pub unknown_size: bool,
    /// Modification time (zero if unset).
    pub modification_time: RawTimestamp,
    /// Creation time (zero if unset).
    pub creation_time: RawTimestamp,
    /// Access time (zero if unset).
    pub access_time: RawTimestamp,
    /// File version; newer versions shadow older ones in the tree view.
    pub version: u32,
    /// Byte offset of the block's packed payload within its volume.
    pub offset: u64,
    /// Volume the header was read from (0-based).
    pub volume_number: usize,
    /// Block index within the logical file (0-based).
    pub part_number: usize,
    /// Number of discovered parts for the file.
    pub total_parts: usize,
}

impl FileHeader {
    /// File mode calculated from the host OS and attribute bits.
    pub fn mode(&self) -> FileMode {
        FileMode::from_attributes(self.host_os, self.attributes, self.is_dir)
    }

    /// Base name of the entry (final path component).
    pub fn base_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// One physical chunk of a file within one volume.
///
/// Immutable once inserted into a [`FileBlockList`](crate::blocklist::FileBlockList);
/// edits such as hash removal replace the slot with a fresh header.
#[derive(Debug, Clone)]
pub(crate) struct FileBlockHeader {
    /// Public metadata decoded from this block's header.
    pub h: FileHeader,
    /// Block starts the logical file.
    pub first: bool,
    /// Block ends the logical file.
    pub last: bool,
    /// Volume this block resides in (0-based).
    pub volnum: usize,
    /// In-volume byte offset where the packed payload begins.
    pub data_off: u64,
    /// Block index within the logical file (0-based).
    pub blocknum: usize,
    /// Cumulative packed offset of this block across its predecessors.
    pub packed_off: u64,
    /// Decoder version; 0 for stored data.
    pub dec_ver: u8,
    /// Decoder window size in bytes.
    pub win_size: u64,
    /// The whole archive is solid.
    pub arc_solid: bool,
    /// Checksum kind and stored digest, if the block carries one.
    pub hash: Option<(HashKind, Vec<u8>)>,
    /// HMAC key applied over digests of encrypted RAR 5 files.
    pub hash_key: Vec<u8>,
    /// Derived AES key; `None` when encrypted but no password was given.
    pub key: Option<Vec<u8>>,
    /// AES initialization vector.
    pub iv: Vec<u8>,
    /// KDF salt.
    pub salt: Vec<u8>,
    /// KDF iteration count used to derive `key`.
    pub kdf_count: u32,
}

impl FileBlockHeader {
    pub(crate) fn packed_size(&self) -> u64 {
        self.h.packed_size.max(0) as u64
    }
}

impl Default for FileBlockHeader {
    fn default() -> Self {
        FileBlockHeader {
            h: FileHeader::default(),
            first: false,
            last: false,
            volnum: 0,
            data_off: 0,
            blocknum: 0,
            packed_off: 0,
            dec_ver: DECODE_STORED,
            win_size: 0,
            arc_solid: false,
            hash: None,
            hash_key: Vec::new(),
            key: None,
            iv: Vec::new(),
            salt: Vec::new(),
            kdf_count: 0,
        }
    }
}
