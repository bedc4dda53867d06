//! Sequential archive readers.
//!
//! [`Reader`] decodes a single-volume archive from any byte stream;
//! [`Archive`] opens a file-backed archive and can follow it across
//! volumes. Both yield one file at a time: `next` advances to the next
//! file header, `io::Read` delivers the decoded contents of the current
//! file.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::decode::FileDecoder;
use crate::error::Result;
use crate::header::FileHeader;
use crate::options::Options;
use crate::packed::PackedFileReader;
use crate::volume::{open_volume, Volume, VolumeManager};

/// Sequential reader over a single-volume archive stream.
///
/// Multi-volume archives need file access to open successor volumes; a
/// continuation block in a bare stream surfaces
/// [`RarError::MultiVolume`](crate::RarError::MultiVolume).
#[derive(Debug)]
pub struct Reader {
    pr: PackedFileReader,
    dec: Option<FileDecoder>,
    options: Options,
}

impl Reader {
    /// Read an archive from `r`. The signature is located immediately,
    /// scanning past any self-extracting stub.
    pub fn new<R: Read + Send + 'static>(r: R, options: Options) -> Result<Self> {
        let vol = Volume::new_stream(Box::new(crate::bufio::StreamSource(r)), &options)?;
        Ok(Reader {
            pr: PackedFileReader::new(vol),
            dec: None,
            options,
        })
    }

    /// Advance to the next file. `Ok(None)` at the end of the archive.
    pub fn next(&mut self) -> Result<Option<FileHeader>> {
        self.dec = None;
        let blocks = match self.pr.next_file()? {
            None => return Ok(None),
            Some(b) => b,
        };
        self.dec = Some(FileDecoder::new(&blocks, &self.options)?);
        let h = blocks.first_block();
        let mut fh = h.h.clone();
        fh.part_number = h.blocknum;
        // provisional until the file's trailing blocks are walked
        fh.total_parts = 1;
        Ok(Some(fh))
    }

    fn read_current(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.dec {
            Some(dec) => dec.read(&mut self.pr, buf),
            None => Ok(0),
        }
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_current(buf).map_err(Into::into)
    }
}

/// Sequential reader over a file-backed archive, following multi-volume
/// sets. Dropping it closes every opened volume.
pub struct Archive {
    pr: PackedFileReader,
    dec: Option<FileDecoder>,
    vm: Arc<VolumeManager>,
    options: Options,
    first_volume: PathBuf,
}

impl Archive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Options::new())
    }

    pub fn open_with(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref();
        let (vol, vm) = open_volume(path, &options)?;
        Ok(Archive {
            pr: PackedFileReader::new(vol),
            dec: None,
            vm,
            options,
            first_volume: path.to_path_buf(),
        })
    }

    /// Advance to the next file. `Ok(None)` at the end of the archive.
    pub fn next(&mut self) -> Result<Option<FileHeader>> {
        self.dec = None;
        let blocks = match self.pr.next_file()? {
            None => return Ok(None),
            Some(b) => b,
        };
        self.dec = Some(FileDecoder::new(&blocks, &self.options)?);
        let h = blocks.first_block();
        let mut fh = h.h.clone();
        fh.part_number = h.blocknum;
        fh.total_parts = 1;
        Ok(Some(fh))
    }

    /// Base names of the volumes used in decoding so far, including the
    /// currently open one.
    pub fn volumes(&self) -> Vec<String> {
        self.vm.files()
    }

    /// True once the archive's main header has declared it part of a
    /// multi-volume set (read by the first call to [`Archive::next`]).
    pub fn is_multi_volume(&self) -> bool {
        self.pr.volume().is_multi_volume()
    }

    /// All file headers across all volumes, one per file, without
    /// touching file contents. Walks the archive with a fresh cursor.
    pub fn read_headers(&self) -> Result<Vec<FileHeader>> {
        crate::list::read_headers_with(&self.first_volume, &self.options)
    }

    /// One header per block/part across all volumes.
    pub fn read_all_headers(&self) -> Result<Vec<FileHeader>> {
        crate::list::read_all_headers_with(&self.first_volume, &self.options)
    }

    fn read_current(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.dec {
            Some(dec) => dec.read(&mut self.pr, buf),
            None => Ok(0),
        }
    }
}

impl Read for Archive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_current(buf).map_err(Into::into)
    }
}
