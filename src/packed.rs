//! Sequential and seekable access to the packed bytes of one file.
//!
//! The packed reader hides volume boundaries: when the current block's
//! data is exhausted it advances to the continuation block, validating
//! name and ordering, and records newly discovered blocks in the file's
//! block list. On seekable sources it can also jump to any packed offset.

use std::sync::Arc;

use tracing::trace;

use crate::blocklist::FileBlockList;
use crate::error::{RarError, Result};
use crate::header::FileBlockHeader;
use crate::volume::Volume;

/// Reader over the packed (still encrypted/compressed) byte stream of
/// one logical file.
#[derive(Debug)]
pub(crate) struct PackedFileReader {
    vol: Volume,
    h: Option<Arc<FileBlockHeader>>,
    blocks: Option<Arc<FileBlockList>>,
    /// Logical packed offset of the next byte.
    offset: u64,
}

impl PackedFileReader {
    pub(crate) fn new(vol: Volume) -> Self {
        PackedFileReader {
            vol,
            h: None,
            blocks: None,
            offset: 0,
        }
    }

    pub(crate) fn can_seek(&self) -> bool {
        self.vol.can_seek()
    }

    pub(crate) fn volume(&self) -> &Volume {
        &self.vol
    }

    /// Header of the block currently being read.
    pub(crate) fn current(&self) -> Option<&Arc<FileBlockHeader>> {
        self.h.as_ref()
    }

    /// Attach this reader to a file's block list without repositioning
    /// the volume cursor (sequential use, cursor already at the data).
    pub(crate) fn init(&mut self, blocks: Arc<FileBlockList>) {
        let first = blocks.first_block();
        self.offset = first.packed_off;
        self.h = Some(first);
        self.blocks = Some(blocks);
    }

    /// Position the cursor at `offset_in_block` inside the given block.
    /// Random access only.
    pub(crate) fn open_block(
        &mut self,
        h: Arc<FileBlockHeader>,
        offset_in_block: u64,
    ) -> Result<u64> {
        if offset_in_block > h.packed_size() {
            return Err(RarError::Invalid);
        }
        self.vol.open_block(
            h.volnum,
            h.data_off + offset_in_block,
            h.packed_size() - offset_in_block,
        )?;
        self.offset = h.packed_off + offset_in_block;
        self.h = Some(h);
        Ok(self.offset)
    }

    /// Advance to the next block of the current file. Returns `false`
    /// when the current block was the file's last.
    pub(crate) fn next_block(&mut self) -> Result<bool> {
        let cur = match &self.h {
            None => return Ok(false),
            Some(h) => h.clone(),
        };
        if cur.last {
            return Ok(false);
        }
        let blocks = self.blocks.clone().ok_or(RarError::Invalid)?;

        // a concurrent reader may have discovered the block already
        if let Some(known) = blocks.get(cur.blocknum + 1) {
            if self.vol.can_seek() {
                self.open_block(known, 0)?;
                return Ok(true);
            }
        }

        let h = match self.vol.next_block()? {
            // the archive ended, but the file has not
            None => return Err(RarError::UnexpectedArchiveEnd),
            Some(h) => h,
        };
        if h.first || h.h.name != cur.h.name {
            return Err(RarError::InvalidFileBlock);
        }
        let mut h = h;
        h.packed_off = cur.packed_off + cur.packed_size();
        h.blocknum = cur.blocknum + 1;
        let h = Arc::new(h);
        blocks.add_block(h.clone());
        trace!(name = %h.h.name, blocknum = h.blocknum, volnum = h.volnum, "continuation block");
        self.offset = h.packed_off;
        self.h = Some(h);
        Ok(true)
    }

    /// Advance to the next file in the archive. `Ok(None)` at the end.
    ///
    /// Any remaining blocks of the current file are walked first, so the
    /// cursor always lands on a block boundary.
    pub(crate) fn next_file(&mut self) -> Result<Option<Arc<FileBlockList>>> {
        while self.next_block()? {}
        let h = match self.vol.next_block() {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(None),
            // a bare stream cannot follow the archive into its next
            // volume; everything before the boundary has been delivered
            Err(RarError::MultiVolume) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !h.first {
            return Err(RarError::InvalidFileBlock);
        }
        let blocks = FileBlockList::new(h);
        self.init(blocks.clone());
        Ok(Some(blocks))
    }

    /// Read packed bytes, advancing across blocks and volumes.
    pub(crate) fn read(&mut self, p: &mut [u8]) -> Result<usize> {
        if p.is_empty() || self.h.is_none() {
            return Ok(0);
        }
        loop {
            let n = self.vol.read(p)?;
            if n > 0 {
                self.offset += n as u64;
                return Ok(n);
            }
            if !self.next_block()? {
                return Ok(0);
            }
        }
    }

    /// Total packed size of the current file, discovering trailing
    /// blocks (and volumes) as needed. Random access only.
    pub(crate) fn packed_size(&mut self) -> Result<u64> {
        let blocks = self.blocks.clone().ok_or(RarError::Invalid)?;
        let last = blocks.last_block();
        if last.last {
            return Ok(last.packed_off + last.packed_size());
        }
        self.open_block(last.clone(), last.packed_size())?;
        while self.next_block()? {}
        let cur = self.h.as_ref().expect("walked from a known block");
        if !cur.last {
            return Err(RarError::InvalidFileBlock);
        }
        Ok(cur.packed_off + cur.packed_size())
    }

    /// Reposition to an absolute packed offset, walking forward block by
    /// block when the offset lies beyond the known list. Overshooting the
    /// file is invalid.
    pub(crate) fn seek_packed(&mut self, target: u64) -> Result<u64> {
        let blocks = self.blocks.clone().ok_or(RarError::Invalid)?;
        if let Some(h) = blocks.find_block(target) {
            let within = target - h.packed_off;
            return self.open_block(h, within);
        }
        let last = blocks.last_block();
        if last.last {
            return Err(RarError::Invalid);
        }
        // walk forward, appending newly discovered blocks to the list
        self.open_block(last.clone(), last.packed_size())?;
        while self.next_block()? {
            let cur = self.h.as_ref().expect("just advanced").clone();
            let within = target.saturating_sub(cur.packed_off);
            if target >= cur.packed_off
                && (within < cur.packed_size() || (within == cur.packed_size() && cur.last))
            {
                return self.open_block(cur, within);
            }
            if cur.last {
                break;
            }
        }
        Err(RarError::Invalid)
    }
}
