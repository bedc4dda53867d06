//! Decompression seam.
//!
//! The entropy decoders (LZSS + Huffman and PPMd for RAR 2.9-4.x, the
//! RAR 5 block decoder) sit behind this narrow interface: a decoder is
//! selected by compression version and initialized with the window size,
//! the solid-reset composition and the expected unpacked size. Decoder
//! state persists across files of a solid archive, which is why
//! initialization happens before any reader is composed.
//!
//! This build registers no entropy decoders; stored data (version 0)
//! bypasses the seam entirely and every compressed version fails fast
//! with [`RarError::UnsupportedDecoder`].

use tracing::debug;

use crate::error::{RarError, Result};
use crate::header::DECODE_STORED;

/// Parameters a decoder is initialized with when a file stream opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecoderParams {
    /// Compression version from the file header.
    pub version: u8,
    /// Sliding-window size in bytes.
    pub win_size: u64,
    /// Reset decoder state before this file (`!solid`).
    pub reset: bool,
    /// The whole archive is solid.
    pub arc_solid: bool,
    /// Declared unpacked size; -1 when unknown.
    pub unpacked_size: i64,
}

/// Select and initialize the decoder for a compression version.
pub(crate) fn init(params: DecoderParams) -> Result<()> {
    match params.version {
        DECODE_STORED => Ok(()),
        v => {
            debug!(
                version = v,
                win_size = params.win_size,
                reset = params.reset,
                arc_solid = params.arc_solid,
                unpacked_size = params.unpacked_size,
                "no registered decoder for compression version"
            );
            Err(RarError::UnsupportedDecoder(v))
        }
    }
}
