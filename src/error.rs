//! Error types for RAR parsing and decoding.
//!
//! All fallible operations in this crate return [`RarError`] (or, for the
//! filesystem view, a [`PathError`] naming the operation and path).

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RarError>;

/// Error type for RAR operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RarError {
    /// No RAR signature was found within the SFX search window.
    #[error("RAR signature not found")]
    NoSignature,

    /// The signature version does not match the expected archive version.
    #[error("unknown archive version")]
    UnknownVersion,

    /// A block header failed its CRC check.
    #[error("bad block header CRC")]
    BadHeaderCrc,

    /// A block header is malformed (impossible size, truncated body).
    #[error("corrupt block header")]
    CorruptBlockHeader,

    /// The decoded file contents do not match the stored checksum.
    #[error("bad file checksum")]
    BadFileChecksum,

    /// The decoded file ended before its declared unpacked size.
    #[error("decoded file too short")]
    ShortFile,

    /// A continuation block does not belong to the current file.
    #[error("invalid file block")]
    InvalidFileBlock,

    /// The archive ended in the middle of a file.
    #[error("unexpected end of archive")]
    UnexpectedArchiveEnd,

    /// The file continues in another volume but the source cannot
    /// provide one (single-stream input).
    #[error("multi-volume archives require file-backed input")]
    MultiVolume,

    /// The file or header is encrypted and no password was supplied.
    #[error("archived file is encrypted, password required")]
    ArchivedFileEncrypted,

    /// The supplied password failed the archive's password check.
    #[error("wrong password")]
    WrongPassword,

    /// Solid files depend on preceding archive state and cannot be
    /// opened for random access.
    #[error("solid files don't support open")]
    SolidOpen,

    /// The compression version has no registered decoder.
    #[error("unsupported decoder version: {0}")]
    UnsupportedDecoder(u8),

    /// A seek or read argument was out of range.
    #[error("invalid argument")]
    Invalid,

    /// The named path does not exist in the archive.
    #[error("file does not exist")]
    NotFound,

    /// The path is not a valid rooted archive path.
    #[error("invalid path")]
    InvalidPath,

    /// An archived file carries a path that cannot be mapped into the tree.
    #[error("archived file has invalid path: {0}")]
    BadArchivePath(String),

    /// An I/O error from the underlying byte source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RarError {
    /// True when the error identifies missing or wrong credentials
    /// rather than a damaged archive.
    pub fn is_password_error(&self) -> bool {
        matches!(
            self,
            RarError::ArchivedFileEncrypted | RarError::WrongPassword
        )
    }
}

impl From<RarError> for io::Error {
    fn from(e: RarError) -> Self {
        match e {
            RarError::Io(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// Error envelope for filesystem-view operations.
///
/// Mirrors the `{operation, path, cause}` shape used by OS path errors so
/// callers can report which lookup failed.
#[derive(Error, Debug)]
#[error("{op} {path}: {source}")]
pub struct PathError {
    /// Operation that failed ("open", "stat", "readdir", ...).
    pub op: &'static str,
    /// Path passed to the operation.
    pub path: String,
    /// Underlying error.
    #[source]
    pub source: RarError,
}

impl PathError {
    pub(crate) fn new(op: &'static str, path: &str, source: RarError) -> Self {
        PathError {
            op,
            path: path.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_round_trip() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let rar: RarError = io_err.into();
        let back: io::Error = rar.into();
        assert_eq!(back.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_path_error_display() {
        let err = PathError::new("open", "a/b.txt", RarError::NotFound);
        assert_eq!(err.to_string(), "open a/b.txt: file does not exist");
    }

    #[test]
    fn test_password_errors() {
        assert!(RarError::ArchivedFileEncrypted.is_password_error());
        assert!(RarError::WrongPassword.is_password_error());
        assert!(!RarError::BadFileChecksum.is_password_error());
    }
}
