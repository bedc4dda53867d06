//! Metadata-only enumeration of archive contents.
//!
//! The listing walk uses the packed reader purely to advance from file
//! to file; contents are only decoded when eager verification was
//! requested. The collected block lists feed the filesystem view, the
//! header listings and the per-part archive info.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::blocklist::FileBlockList;
use crate::bufio::BufVolumeReader;
use crate::decode::{ArchiveFile, FileDecoder};
use crate::error::{RarError, Result};
use crate::header::{FileBlockHeader, FileHeader};
use crate::options::Options;
use crate::packed::PackedFileReader;
use crate::parsing::{BlockParser, NextBlock};
use crate::volume::{next_volume_name, open_volume, VolumeManager};

/// Walk every block of every file across all volumes.
///
/// With `open_check`, each file carrying a hash is streamed through its
/// decode stack and verified eagerly.
pub(crate) fn read_all_file_blocks(
    path: &Path,
    options: &Options,
) -> Result<(Arc<VolumeManager>, Vec<Arc<FileBlockList>>)> {
    let mut options = options.clone();
    if options.open_check {
        options.skip_check = false;
    }
    let (vol, vm) = open_volume(path, &options)?;
    let mut pr = PackedFileReader::new(vol);
    let mut lists = Vec::new();
    loop {
        let blocks = match pr.next_file()? {
            None => break,
            Some(b) => b,
        };
        lists.push(blocks.clone());
        if options.open_check && blocks.has_file_hash() {
            let mut dec = FileDecoder::new(&blocks, &options)?;
            let mut sink = [0u8; 4096];
            loop {
                let n = dec.read(&mut pr, &mut sink)?;
                if n == 0 {
                    break;
                }
            }
        }
    }
    debug!(files = lists.len(), volumes = vm.files().len(), "listed archive");
    Ok((vm, lists))
}

fn file_header_of(blocks: &FileBlockList) -> FileHeader {
    let h = blocks.first_block();
    let mut fh = h.h.clone();
    fh.part_number = h.blocknum;
    fh.total_parts = blocks.len();
    fh
}

/// One header per logical file, `total_parts` counting discovered blocks.
pub fn read_headers(path: impl AsRef<Path>, options: Options) -> Result<Vec<FileHeader>> {
    read_headers_with(path.as_ref(), &options)
}

pub(crate) fn read_headers_with(path: &Path, options: &Options) -> Result<Vec<FileHeader>> {
    let (_vm, lists) = read_all_file_blocks(path, options)?;
    Ok(lists.iter().map(|b| file_header_of(b)).collect())
}

/// One header per block/part, exposing every volume/part combination.
pub fn read_all_headers(path: impl AsRef<Path>, options: Options) -> Result<Vec<FileHeader>> {
    read_all_headers_with(path.as_ref(), &options)
}

pub(crate) fn read_all_headers_with(path: &Path, options: &Options) -> Result<Vec<FileHeader>> {
    let (_vm, lists) = read_all_file_blocks(path, options)?;
    let mut out = Vec::new();
    for blocks in &lists {
        let total = blocks.len();
        for h in blocks.blocks() {
            let mut fh = h.h.clone();
            fh.part_number = h.blocknum;
            fh.total_parts = total;
            out.push(fh);
        }
    }
    Ok(out)
}

/// A file entry from [`list`]: its metadata and a handle to open the
/// decoded contents.
pub struct Entry {
    header: FileHeader,
    blocks: Arc<FileBlockList>,
    vm: Arc<VolumeManager>,
}

impl Entry {
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Open the decoded contents for reading.
    ///
    /// Fails for solid files ([`RarError::SolidOpen`]); use a sequential
    /// [`Archive`](crate::Archive) for those.
    pub fn open(&self) -> Result<ArchiveFile> {
        ArchiveFile::open(&self.vm, &self.blocks)
    }
}

/// List the files in an archive with openable content handles.
pub fn list(path: impl AsRef<Path>, options: Options) -> Result<Vec<Entry>> {
    let (vm, lists) = read_all_file_blocks(path.as_ref(), &options)?;
    Ok(lists
        .into_iter()
        .map(|blocks| Entry {
            header: file_header_of(&blocks),
            blocks,
            vm: vm.clone(),
        })
        .collect())
}

/// One volume part of a file.
#[derive(Debug, Clone)]
pub struct FilePartInfo {
    /// Full path to the volume file.
    pub path: PathBuf,
    /// Byte offset where the packed data starts in the volume.
    pub data_offset: u64,
    /// Packed size of this part.
    pub packed_size: i64,
    /// Total unpacked size of the complete file.
    pub unpacked_size: i64,
    /// Data is stored rather than compressed.
    pub stored: bool,
    /// Part is encrypted.
    pub encrypted: bool,
    /// KDF salt (encrypted parts with a supplied password only).
    pub salt: Vec<u8>,
    /// Derived AES key.
    pub aes_key: Vec<u8>,
    /// AES IV.
    pub aes_iv: Vec<u8>,
    /// KDF iteration count.
    pub kdf_iterations: u32,
}

/// A complete file with all its volume parts.
#[derive(Debug, Clone)]
pub struct ArchiveFileInfo {
    pub name: String,
    pub total_packed_size: i64,
    pub total_unpacked_size: i64,
    pub parts: Vec<FilePartInfo>,
    pub any_encrypted: bool,
    pub all_stored: bool,
}

fn part_info(h: &FileBlockHeader, path: PathBuf) -> FilePartInfo {
    let stored = h.dec_ver == 0;
    let mut part = FilePartInfo {
        path,
        data_offset: h.data_off,
        packed_size: h.h.packed_size,
        unpacked_size: h.h.unpacked_size,
        stored,
        encrypted: h.h.encrypted,
        salt: Vec::new(),
        aes_key: Vec::new(),
        aes_iv: Vec::new(),
        kdf_iterations: 0,
    };
    if h.h.encrypted {
        if let Some(key) = &h.key {
            part.salt = h.salt.clone();
            part.aes_key = key.clone();
            part.aes_iv = h.iv.clone();
            part.kdf_iterations = h.kdf_count;
        }
    }
    part
}

fn archive_info_from_lists(
    lists: &[Arc<FileBlockList>],
    path_of: impl Fn(usize) -> Option<PathBuf>,
) -> Vec<ArchiveFileInfo> {
    let mut out = Vec::with_capacity(lists.len());
    for blocks in lists {
        let block_list = blocks.blocks();
        let first = match block_list.first() {
            None => continue,
            Some(f) => f,
        };
        let mut info = ArchiveFileInfo {
            name: first.h.name.clone(),
            total_packed_size: 0,
            total_unpacked_size: first.h.unpacked_size,
            parts: Vec::with_capacity(block_list.len()),
            any_encrypted: false,
            all_stored: true,
        };
        for h in &block_list {
            let path = path_of(h.volnum).unwrap_or_default();
            let part = part_info(h, path);
            info.total_packed_size += part.packed_size;
            if !part.stored {
                info.all_stored = false;
            }
            if part.encrypted {
                info.any_encrypted = true;
            }
            info.parts.push(part);
        }
        // files with no recorded size carry nothing to extract
        if info.total_unpacked_size > 0 {
            out.push(info);
        }
    }
    out
}

/// Per-part metadata for every file: volume path, data offset, packed
/// size, stored/encrypted flags and, when a password was supplied, the
/// derived encryption material.
pub fn list_archive_info(path: impl AsRef<Path>, options: Options) -> Result<Vec<ArchiveFileInfo>> {
    let (vm, lists) = read_all_file_blocks(path.as_ref(), &options)?;
    Ok(archive_info_from_lists(&lists, |volnum| {
        vm.volume_path(volnum)
    }))
}

/// Best-effort parallel variant of [`list_archive_info`].
///
/// Volumes are discovered by filename probing and scanned concurrently,
/// up to [`Options::max_concurrent_volumes`] at a time; results are
/// stitched in volume order and match the sequential listing. Falls back
/// to the sequential walk for single-volume archives or a concurrency
/// below 2.
pub fn list_archive_info_parallel(
    path: impl AsRef<Path>,
    options: Options,
) -> Result<Vec<ArchiveFileInfo>> {
    let path = path.as_ref();
    let concurrency = options.max_concurrent_volumes;
    let volumes = discover_volumes(path);
    if concurrency < 2 || volumes.len() < 2 {
        return list_archive_info(path, options);
    }
    debug!(volumes = volumes.len(), concurrency, "parallel volume scan");

    let mut scanned: Vec<Vec<FileBlockHeader>> = Vec::with_capacity(volumes.len());
    for chunk_start in (0..volumes.len()).step_by(concurrency) {
        let chunk_end = (chunk_start + concurrency).min(volumes.len());
        let mut results = thread::scope(|s| -> Result<Vec<Vec<FileBlockHeader>>> {
            let handles: Vec<_> = (chunk_start..chunk_end)
                .map(|i| {
                    let vol_path = &volumes[i];
                    let opts = &options;
                    s.spawn(move || scan_volume(vol_path, opts, i))
                })
                .collect();
            let mut out = Vec::with_capacity(handles.len());
            for handle in handles {
                out.push(handle.join().expect("volume scan thread panicked")?);
            }
            Ok(out)
        })?;
        scanned.append(&mut results);
    }

    let lists = stitch_volume_blocks(scanned)?;
    Ok(archive_info_from_lists(&lists, |volnum| {
        volumes.get(volnum).cloned()
    }))
}

/// Probe the filesystem for successor volumes of `first`.
fn discover_volumes(first: &Path) -> Vec<PathBuf> {
    const MAX_VOLUMES: usize = 10_000;
    let mut out = vec![first.to_path_buf()];
    let dir = first.parent().unwrap_or(Path::new(""));
    let Some(mut name) = first.file_name().and_then(|n| n.to_str()).map(String::from) else {
        return out;
    };
    while out.len() < MAX_VOLUMES {
        let Some(next) = next_volume_name(&name, false) else {
            break;
        };
        let candidate = dir.join(&next);
        if !candidate.is_file() {
            break;
        }
        out.push(candidate);
        name = next;
    }
    out
}

/// Collect the file blocks of one volume without touching file data.
fn scan_volume(path: &Path, options: &Options, volnum: usize) -> Result<Vec<FileBlockHeader>> {
    let file = fs::File::open(path)?;
    let (mut br, sig) = BufVolumeReader::with_signature(Box::new(file))?;
    let mut parser = BlockParser::new(sig, options);
    let mut out = Vec::new();
    loop {
        match parser.next_block(&mut br, volnum)? {
            NextBlock::File(h) => {
                let skip = h.packed_size();
                out.push(h);
                br.discard(skip)?;
            }
            NextBlock::EndOfVolume | NextBlock::EndOfArchive => break,
        }
    }
    Ok(out)
}

/// Merge per-volume block sequences into per-file block lists,
/// re-deriving block numbering and cumulative packed offsets.
fn stitch_volume_blocks(scanned: Vec<Vec<FileBlockHeader>>) -> Result<Vec<Arc<FileBlockList>>> {
    let mut lists: Vec<Arc<FileBlockList>> = Vec::new();
    let mut open: Option<Arc<FileBlockList>> = None;
    for volume_blocks in scanned {
        for h in volume_blocks {
            if h.first {
                let list = FileBlockList::new(h);
                lists.push(list.clone());
                open = Some(list);
            } else {
                let list = open.as_ref().ok_or(RarError::InvalidFileBlock)?;
                let prev = list.last_block();
                if prev.last || prev.h.name != h.h.name {
                    return Err(RarError::InvalidFileBlock);
                }
                let mut h = h;
                h.blocknum = prev.blocknum + 1;
                h.packed_off = prev.packed_off + prev.packed_size();
                list.add_block(Arc::new(h));
            }
        }
    }
    Ok(lists)
}
