//! Read-only decoder for RAR archives (versions 1.5 and 5.0).
//!
//! The crate exposes the contents of one or more archive volumes as a
//! navigable file tree: per-file metadata (name, sizes, timestamps,
//! attributes, encryption and compression status) and, on demand, a byte
//! stream of the original file contents verified against the stored
//! checksum.
//!
//! ## Reading an archive
//!
//! ```rust,no_run
//! use std::io::Read;
//! use rarfs::{ArchiveFs, Options};
//!
//! let rfs = ArchiveFs::open_with("archive.part1.rar", Options::new().password("secret"))?;
//! for entry in rfs.read_dir(".")? {
//!     println!("{} ({} bytes)", entry.name, entry.size);
//! }
//! let contents = rfs.read_file("docs/readme.txt")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Streaming
//!
//! [`Reader`] decodes single-volume archives from any [`std::io::Read`]
//! source; [`Archive`] opens file-backed archives and follows
//! multi-volume sets. [`list`] and [`list_archive_info`] enumerate
//! metadata without decoding contents.
//!
//! Multi-volume sets are stitched transparently: files spanning volumes
//! read as one continuous stream, and random access (where the source
//! supports seeking) maps offsets back to the owning volume.

mod blocklist;
mod bufio;
mod crypto;
mod decode;
mod decompress;
mod error;
mod format;
mod fs;
mod header;
mod list;
mod options;
mod packed;
mod parsing;
mod reader;
mod volume;

#[cfg(test)]
mod testutil;

pub use decode::ArchiveFile;
pub use error::{PathError, RarError, Result};
pub use format::{FileMode, HostOs, RawTimestamp, Signature};
pub use fs::{ArchiveFs, DirFile, FileInfo, FsFile};
pub use header::FileHeader;
pub use list::{
    list, list_archive_info, list_archive_info_parallel, read_all_headers, read_headers,
    ArchiveFileInfo, Entry, FilePartInfo,
};
pub use options::Options;
pub use reader::{Archive, Reader};
