//! The ordered list of blocks that make up one logical file.
//!
//! The list is append-only: new blocks are discovered mid-stream by
//! whichever reader reaches them first, while other readers of the same
//! file may be inspecting the list concurrently.

use std::sync::{Arc, RwLock};

use crate::header::FileBlockHeader;

/// Ordered, append-only sequence of block headers for one logical file.
///
/// Invariants: `blocks[0].first` holds; `blocks[i].blocknum == i`;
/// `blocks[i].packed_off` is the sum of preceding packed sizes; all blocks
/// share one name; once discovery completes, the final block has `last`.
#[derive(Debug)]
pub(crate) struct FileBlockList {
    blocks: RwLock<Vec<Arc<FileBlockHeader>>>,
}

impl FileBlockList {
    pub(crate) fn new(first: FileBlockHeader) -> Arc<Self> {
        Arc::new(FileBlockList {
            blocks: RwLock::new(vec![Arc::new(first)]),
        })
    }

    pub(crate) fn first_block(&self) -> Arc<FileBlockHeader> {
        self.blocks.read().unwrap()[0].clone()
    }

    pub(crate) fn last_block(&self) -> Arc<FileBlockHeader> {
        let blocks = self.blocks.read().unwrap();
        blocks[blocks.len() - 1].clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    /// Snapshot of all known blocks in order.
    pub(crate) fn blocks(&self) -> Vec<Arc<FileBlockHeader>> {
        self.blocks.read().unwrap().clone()
    }

    pub(crate) fn get(&self, blocknum: usize) -> Option<Arc<FileBlockHeader>> {
        self.blocks.read().unwrap().get(blocknum).cloned()
    }

    /// Find the block containing the given absolute packed offset.
    ///
    /// A file's block count is small, so a linear scan suffices. An offset
    /// equal to the total packed size resolves to the last block (EOF
    /// position) when that block is final.
    pub(crate) fn find_block(&self, mut offset: u64) -> Option<Arc<FileBlockHeader>> {
        let blocks = self.blocks.read().unwrap();
        for h in blocks.iter() {
            let size = h.packed_size();
            if offset < size || (offset == size && h.last) {
                return Some(h.clone());
            }
            offset -= size;
        }
        None
    }

    /// Append a newly discovered block.
    ///
    /// Idempotent with respect to `blocknum`: the block is recorded only
    /// if it extends the list, so two readers walking the same file cannot
    /// double-append.
    pub(crate) fn add_block(&self, h: Arc<FileBlockHeader>) {
        let mut blocks = self.blocks.write().unwrap();
        if blocks.len() == h.blocknum {
            blocks.push(h);
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.blocks.read().unwrap()[0].h.is_dir
    }

    pub(crate) fn has_file_hash(&self) -> bool {
        self.blocks.read().unwrap()[0].hash.is_some()
    }

    /// Drop the stored hash after a successful verification.
    ///
    /// Headers are immutable, so the first slot is replaced with a fresh
    /// copy that carries no hash; later opens of the same file skip
    /// re-verification.
    pub(crate) fn remove_file_hash(&self) {
        let mut blocks = self.blocks.write().unwrap();
        let mut h = (*blocks[0]).clone();
        h.hash = None;
        blocks[0] = Arc::new(h);
    }

}
