//! Filesystem view over an archive: a path-keyed tree built from the
//! flat file list, with open/stat/readdir/sub operations.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::blocklist::FileBlockList;
use crate::decode::ArchiveFile;
use crate::error::{PathError, RarError, Result};
use crate::format::{FileMode, RawTimestamp};
use crate::header::FileHeader;
use crate::list::read_all_file_blocks;
use crate::options::Options;
use crate::volume::VolumeManager;

/// Metadata of one tree entry.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Base name of the entry.
    pub name: String,
    /// Unpacked size; 0 for directories, -1 when unknown.
    pub size: i64,
    /// File mode derived from host attributes.
    pub mode: FileMode,
    /// Modification time (zero when unset).
    pub modified: RawTimestamp,
    /// Entry is a directory.
    pub is_dir: bool,
}

impl FileInfo {
    fn from_header(h: &FileHeader) -> Self {
        FileInfo {
            name: h.base_name().to_string(),
            size: if h.is_dir { 0 } else { h.unpacked_size },
            mode: h.mode(),
            modified: h.modification_time,
            is_dir: h.is_dir,
        }
    }

    /// Synthesized entry for a directory the archive never named.
    fn dummy_dir(name: &str) -> Self {
        FileInfo {
            name: base_name(name).to_string(),
            size: 0,
            mode: FileMode::dummy_dir(),
            modified: RawTimestamp::default(),
            is_dir: true,
        }
    }
}

/// A node in the path-keyed tree: a file backed by a block list, or a
/// directory (explicit or synthesized) with child path keys.
#[derive(Debug)]
struct FsNode {
    name: String,
    blocks: Option<Arc<FileBlockList>>,
    children: Vec<String>,
}

impl FsNode {
    fn is_dir(&self) -> bool {
        match &self.blocks {
            None => true,
            Some(blocks) => blocks.is_dir(),
        }
    }

    fn info(&self) -> FileInfo {
        match &self.blocks {
            None => FileInfo::dummy_dir(&self.name),
            Some(blocks) => FileInfo::from_header(&blocks.first_block().h),
        }
    }
}

/// An opened tree entry: a readable file or a directory handle.
pub enum FsFile {
    File(ArchiveFile),
    Dir(DirFile),
}

impl FsFile {
    pub fn stat(&self) -> FileInfo {
        match self {
            FsFile::File(f) => FileInfo::from_header(&f.header()),
            FsFile::Dir(d) => d.info.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FsFile::Dir(_))
    }
}

impl Read for FsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FsFile::File(f) => f.read(buf),
            FsFile::Dir(_) => Ok(0),
        }
    }
}

/// Directory handle with an entry iterator.
pub struct DirFile {
    info: FileInfo,
    entries: Vec<FileInfo>,
    index: usize,
}

impl DirFile {
    /// Next `n` entries; all remaining when `n` is 0.
    pub fn read_dir(&mut self, n: usize) -> Vec<FileInfo> {
        if n == 0 {
            return self.entries.clone();
        }
        let end = (self.index + n).min(self.entries.len());
        let out = self.entries[self.index..end].to_vec();
        self.index = end;
        out
    }
}

type PathResult<T> = std::result::Result<T, PathError>;

/// Read-only filesystem view of an archive.
///
/// Each opened file drives its own volume cursor, so distinct files can
/// be read concurrently.
#[derive(Debug)]
pub struct ArchiveFs {
    vm: Arc<VolumeManager>,
    tree: HashMap<String, FsNode>,
}

impl ArchiveFs {
    /// Open the archive at `path` and build the tree from its file list.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Options::new())
    }

    pub fn open_with(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let (vm, lists) = read_all_file_blocks(path.as_ref(), &options)?;
        Self::build(vm, lists)
    }

    fn build(vm: Arc<VolumeManager>, lists: Vec<Arc<FileBlockList>>) -> Result<Self> {
        let mut tree: HashMap<String, FsNode> = HashMap::new();
        tree.insert(
            ".".to_string(),
            FsNode {
                name: ".".to_string(),
                blocks: None,
                children: Vec::new(),
            },
        );
        for blocks in lists {
            let h = blocks.first_block();
            let name = clean_path(h.h.name.trim_start_matches('/'));
            if !valid_path(&name) || name == "." {
                return Err(RarError::BadArchivePath(name));
            }
            if let Some(node) = tree.get_mut(&name) {
                // later entries shadow earlier ones only with a newer
                // file version
                let replace = match &node.blocks {
                    None => true,
                    Some(existing) => existing.first_block().h.version < h.h.version,
                };
                if replace {
                    node.blocks = Some(blocks);
                }
                continue;
            }
            tree.insert(
                name.clone(),
                FsNode {
                    name: name.clone(),
                    blocks: Some(blocks),
                    children: Vec::new(),
                },
            );
            // synthesize missing ancestors and link the chain
            let mut child = name;
            loop {
                let parent = parent_path(&child).to_string();
                if let Some(node) = tree.get_mut(&parent) {
                    node.children.push(child);
                    break;
                }
                tree.insert(
                    parent.clone(),
                    FsNode {
                        name: parent.clone(),
                        blocks: None,
                        children: vec![child],
                    },
                );
                child = parent;
            }
        }
        debug!(entries = tree.len(), "built filesystem view");
        Ok(ArchiveFs { vm, tree })
    }

    fn node(&self, op: &'static str, name: &str) -> PathResult<&FsNode> {
        if !valid_path(name) {
            return Err(PathError::new(op, name, RarError::InvalidPath));
        }
        self.tree
            .get(name)
            .ok_or_else(|| PathError::new(op, name, RarError::NotFound))
    }

    fn sorted_entries(&self, node: &FsNode) -> Vec<FileInfo> {
        let mut entries: Vec<FileInfo> = node
            .children
            .iter()
            .filter_map(|key| self.tree.get(key))
            .map(|child| child.info())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Open a file or directory.
    pub fn open_file(&self, name: &str) -> PathResult<FsFile> {
        let node = self.node("open", name)?;
        if node.is_dir() {
            return Ok(FsFile::Dir(DirFile {
                info: node.info(),
                entries: self.sorted_entries(node),
                index: 0,
            }));
        }
        let blocks = node.blocks.as_ref().expect("file nodes have blocks");
        let file = ArchiveFile::open(&self.vm, blocks)
            .map_err(|e| PathError::new("open", name, e))?;
        Ok(FsFile::File(file))
    }

    /// Directory entries sorted by base name.
    pub fn read_dir(&self, name: &str) -> PathResult<Vec<FileInfo>> {
        let node = self.node("readdir", name)?;
        if !node.is_dir() {
            return Err(PathError::new("readdir", name, RarError::InvalidPath));
        }
        Ok(self.sorted_entries(node))
    }

    /// Full decoded contents of a file.
    pub fn read_file(&self, name: &str) -> PathResult<Vec<u8>> {
        let node = self.node("readfile", name)?;
        if node.is_dir() {
            return Ok(Vec::new());
        }
        let blocks = node.blocks.as_ref().expect("file nodes have blocks");
        let mut file = ArchiveFile::open(&self.vm, blocks)
            .map_err(|e| PathError::new("readfile", name, e))?;
        let h = blocks.first_block();
        let mut out = if h.h.unknown_size {
            Vec::new()
        } else {
            Vec::with_capacity(h.h.unpacked_size.max(0) as usize)
        };
        file.read_to_end(&mut out)
            .map_err(|e| PathError::new("readfile", name, RarError::from(e)))?;
        Ok(out)
    }

    /// Metadata of a file or directory.
    pub fn stat(&self, name: &str) -> PathResult<FileInfo> {
        Ok(self.node("stat", name)?.info())
    }

    /// Stream a file through its decode stack, discarding the output,
    /// purely to verify the stored checksum.
    pub fn check(&self, name: &str) -> PathResult<()> {
        let node = self.node("check", name)?;
        if node.is_dir() {
            return Err(PathError::new("check", name, RarError::InvalidPath));
        }
        let blocks = node.blocks.as_ref().expect("file nodes have blocks");
        if !blocks.has_file_hash() {
            return Ok(());
        }
        let mut file = ArchiveFile::open(&self.vm, blocks)
            .map_err(|e| PathError::new("check", name, e))?;
        let mut sink = [0u8; 4096];
        loop {
            match file.read(&mut sink) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(PathError::new("check", name, RarError::from(e))),
            }
        }
    }

    /// A view rooted at `dir`, sharing this archive's volume manager.
    pub fn sub(&self, dir: &str) -> PathResult<ArchiveFs> {
        if dir == "." {
            return Ok(ArchiveFs {
                vm: self.vm.clone(),
                tree: self.clone_tree(),
            });
        }
        let node = self.node("sub", dir)?;
        if !node.is_dir() {
            return Err(PathError::new("sub", dir, RarError::InvalidPath));
        }
        let prefix = format!("{dir}/");
        let strip = |key: &str| -> Option<String> {
            if key == dir {
                Some(".".to_string())
            } else {
                key.strip_prefix(&prefix).map(str::to_string)
            }
        };
        let mut tree = HashMap::new();
        for (key, node) in &self.tree {
            let Some(new_key) = strip(key) else { continue };
            tree.insert(
                new_key.clone(),
                FsNode {
                    name: if new_key == "." {
                        ".".to_string()
                    } else {
                        node.name.clone()
                    },
                    blocks: node.blocks.clone(),
                    children: node.children.iter().filter_map(|c| strip(c)).collect(),
                },
            );
        }
        Ok(ArchiveFs {
            vm: self.vm.clone(),
            tree,
        })
    }

    fn clone_tree(&self) -> HashMap<String, FsNode> {
        self.tree
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    FsNode {
                        name: v.name.clone(),
                        blocks: v.blocks.clone(),
                        children: v.children.clone(),
                    },
                )
            })
            .collect()
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => ".",
    }
}

/// Rooted-path validity: `/`-separated, no empty, `.` or `..`
/// components; the literal `"."` names the root.
fn valid_path(name: &str) -> bool {
    if name == "." {
        return true;
    }
    if name.is_empty() {
        return false;
    }
    name.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Lexically normalize a `/`-separated path.
fn clean_path(name: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for comp in name.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    out.push("..");
                }
            }
            c => out.push(c),
        }
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}
