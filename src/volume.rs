//! Physical volumes and the manager that names, opens and tracks them.
//!
//! A [`Volume`] is one cursor over one physical file: buffered reader,
//! block parser and the unread remainder of the current data area. The
//! [`VolumeManager`] owns the ordered list of discovered volume names and
//! hands out successor volumes and fresh cursors for random access.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bufio::{BufVolumeReader, ByteSource};
use crate::error::{RarError, Result};
use crate::format::Signature;
use crate::header::FileBlockHeader;
use crate::options::Options;
use crate::parsing::{BlockParser, NextBlock};

/// Tracks the ordered set of volume files belonging to one archive.
#[derive(Debug)]
pub(crate) struct VolumeManager {
    dir: PathBuf,
    files: Mutex<Vec<String>>,
    sig: Signature,
    options: Options,
    /// Snapshot of the most recent parser state, cloned into fresh
    /// cursors so they inherit archive flags and header-encryption keys.
    parser_template: Mutex<Option<BlockParser>>,
}

impl VolumeManager {
    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    /// Base names of the volumes used so far, in order.
    pub(crate) fn files(&self) -> Vec<String> {
        self.files.lock().unwrap().clone()
    }

    /// Full path of a discovered volume.
    pub(crate) fn volume_path(&self, volnum: usize) -> Option<PathBuf> {
        let files = self.files.lock().unwrap();
        files.get(volnum).map(|name| self.dir.join(name))
    }

    pub(crate) fn save_parser(&self, parser: &BlockParser) {
        *self.parser_template.lock().unwrap() = Some(parser.clone());
    }

    fn cursor_parser(&self) -> BlockParser {
        self.parser_template
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| BlockParser::new(self.sig, &self.options))
    }

    /// Open the volume after `cur`, synthesizing its name when it has not
    /// been seen yet, and verify its signature version.
    fn open_next(&self, cur: usize, legacy_hint: bool) -> Result<(usize, BufVolumeReader)> {
        let next = cur + 1;
        let name = {
            let files = self.files.lock().unwrap();
            match files.get(next) {
                Some(name) => name.clone(),
                None => {
                    let cur_name = files.get(cur).ok_or(RarError::Invalid)?;
                    next_volume_name(cur_name, legacy_hint)
                        .ok_or(RarError::UnexpectedArchiveEnd)?
                }
            }
        };
        let path = self.dir.join(&name);
        debug!(volume = %name, "opening next volume");
        let file = fs::File::open(&path)?;
        let (br, sig) = BufVolumeReader::with_signature(Box::new(file))?;
        if sig != self.sig {
            return Err(RarError::UnknownVersion);
        }
        let mut files = self.files.lock().unwrap();
        if files.len() == next {
            files.push(name);
        }
        Ok((next, br))
    }

    /// Open a raw (unparsed) handle to a known volume for random access.
    fn open_raw(&self, volnum: usize) -> Result<Box<dyn ByteSource>> {
        let path = self.volume_path(volnum).ok_or(RarError::Invalid)?;
        Ok(Box::new(fs::File::open(path)?))
    }

    /// Fresh cursor over a known volume, positioned at the start of the
    /// data area passed to [`Volume::open_block`] by the caller.
    pub(crate) fn open_cursor(self: &Arc<Self>, volnum: usize) -> Result<Volume> {
        let src = self.open_raw(volnum)?;
        let br = BufVolumeReader::new(src);
        Ok(Volume {
            vm: Some(self.clone()),
            br,
            parser: self.cursor_parser(),
            num: volnum,
            data_left: 0,
        })
    }
}

/// One cursor over the archive: the current physical volume, its parser,
/// and the unread remainder of the current block's data area.
#[derive(Debug)]
pub(crate) struct Volume {
    vm: Option<Arc<VolumeManager>>,
    br: BufVolumeReader,
    parser: BlockParser,
    num: usize,
    data_left: u64,
}

/// Open the first volume of a file-backed archive.
pub(crate) fn open_volume(path: &Path, options: &Options) -> Result<(Volume, Arc<VolumeManager>)> {
    let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(RarError::Invalid)?
        .to_string();
    let file = fs::File::open(path)?;
    let (br, sig) = BufVolumeReader::with_signature(Box::new(file))?;
    debug!(volume = %base, ?sig, "opened first volume");
    let vm = Arc::new(VolumeManager {
        dir,
        files: Mutex::new(vec![base]),
        sig,
        options: options.clone(),
        parser_template: Mutex::new(None),
    });
    let vol = Volume {
        vm: Some(vm.clone()),
        parser: BlockParser::new(sig, options),
        br,
        num: 0,
        data_left: 0,
    };
    Ok((vol, vm))
}

impl Volume {
    /// Volume over a single in-memory or streamed source. Continuation
    /// into further volumes is impossible and surfaces [`RarError::MultiVolume`].
    pub(crate) fn new_stream(src: Box<dyn ByteSource>, options: &Options) -> Result<Self> {
        let (br, sig) = BufVolumeReader::with_signature(src)?;
        Ok(Volume {
            vm: None,
            parser: BlockParser::new(sig, options),
            br,
            num: 0,
            data_left: 0,
        })
    }

    pub(crate) fn can_seek(&self) -> bool {
        self.vm.is_some() && self.br.can_seek()
    }

    /// True once a main header has declared the archive part of a
    /// multi-volume set.
    pub(crate) fn is_multi_volume(&self) -> bool {
        self.parser.is_multi_volume()
    }

    /// Advance to the next file block, crossing volume boundaries as
    /// demanded. `Ok(None)` is the end of the archive. Any unread data of
    /// the current block is skipped first.
    pub(crate) fn next_block(&mut self) -> Result<Option<FileBlockHeader>> {
        loop {
            if self.data_left > 0 {
                self.br.discard(self.data_left).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        RarError::UnexpectedArchiveEnd
                    } else {
                        RarError::Io(e)
                    }
                })?;
                self.data_left = 0;
            }
            let next = self.parser.next_block(&mut self.br, self.num)?;
            if let Some(vm) = &self.vm {
                vm.save_parser(&self.parser);
            }
            match next {
                NextBlock::File(h) => {
                    self.data_left = h.packed_size();
                    return Ok(Some(h));
                }
                NextBlock::EndOfVolume => {
                    let vm = self.vm.as_ref().ok_or(RarError::MultiVolume)?;
                    let (num, br) = vm.open_next(self.num, self.parser.legacy_naming())?;
                    self.br = br;
                    self.num = num;
                    self.parser.reset_volume();
                }
                NextBlock::EndOfArchive => return Ok(None),
            }
        }
    }

    /// Read packed bytes of the current block; `Ok(0)` when exhausted.
    pub(crate) fn read(&mut self, p: &mut [u8]) -> Result<usize> {
        if self.data_left == 0 || p.is_empty() {
            return Ok(0);
        }
        let want = p.len().min(self.data_left.min(usize::MAX as u64) as usize);
        let n = self.br.read(&mut p[..want])?;
        if n == 0 {
            // the volume file ended inside a declared data area
            return Err(RarError::UnexpectedArchiveEnd);
        }
        self.data_left -= n as u64;
        Ok(n)
    }

    /// Position this cursor at `off` within volume `volnum` with `len`
    /// packed bytes remaining. Random access only.
    pub(crate) fn open_block(&mut self, volnum: usize, off: u64, len: u64) -> Result<()> {
        if !self.can_seek() {
            return Err(RarError::MultiVolume);
        }
        if volnum != self.num {
            let vm = self.vm.as_ref().expect("seekable volumes have a manager");
            let src = vm.open_raw(volnum)?;
            self.br = BufVolumeReader::new(src);
            self.num = volnum;
        }
        self.br.seek_to(off)?;
        self.data_left = len;
        Ok(())
    }
}

/// Synthesize the successor of a volume file name.
///
/// Recognizes the modern `name.partNN.rar` scheme (zero-padded increment)
/// and the legacy `.rar` → `.r00` → … → `.r99` → `.s00` scheme. Returns
/// `None` for unrecognized patterns, which are treated as single-volume.
pub(crate) fn next_volume_name(name: &str, legacy_hint: bool) -> Option<String> {
    if !legacy_hint {
        if let Some(next) = next_part_name(name) {
            return Some(next);
        }
    }
    next_legacy_name(name)
}

fn next_part_name(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    let stem_end = lower.strip_suffix(".rar")?.len();
    let digits_end = stem_end;
    let digits_start = name[..digits_end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)?;
    if digits_start == digits_end || !lower[..digits_start].ends_with(".part") {
        return None;
    }
    let next_digits = increment_decimal(&name[digits_start..digits_end]);
    Some(format!(
        "{}{}{}",
        &name[..digits_start],
        next_digits,
        &name[stem_end..]
    ))
}

fn next_legacy_name(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    let ext = &name[dot + 1..];
    if ext.eq_ignore_ascii_case("rar") {
        return Some(format!("{}.r00", &name[..dot]));
    }
    let b = ext.as_bytes();
    if b.len() == 3 && b[0].is_ascii_alphabetic() && b[1].is_ascii_digit() && b[2].is_ascii_digit()
    {
        let num = (b[1] - b'0') * 10 + (b[2] - b'0');
        let (letter, num) = if num == 99 {
            (b[0] + 1, 0)
        } else {
            (b[0], num + 1)
        };
        if !letter.is_ascii_alphabetic() {
            return None;
        }
        return Some(format!("{}.{}{:02}", &name[..dot], letter as char, num));
    }
    None
}

/// Increment a decimal string preserving zero padding; the width grows
/// only on all-nines overflow.
fn increment_decimal(digits: &str) -> String {
    let mut bytes: Vec<u8> = digits.bytes().collect();
    let mut i = bytes.len();
    loop {
        if i == 0 {
            bytes.insert(0, b'1');
            break;
        }
        i -= 1;
        if bytes[i] < b'9' {
            bytes[i] += 1;
            break;
        }
        bytes[i] = b'0';
    }
    String::from_utf8(bytes).expect("decimal digits")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_naming() {
        assert_eq!(
            next_volume_name("a.part1.rar", false).unwrap(),
            "a.part2.rar"
        );
        assert_eq!(
            next_volume_name("a.part01.rar", false).unwrap(),
            "a.part02.rar"
        );
        assert_eq!(
            next_volume_name("a.part09.rar", false).unwrap(),
            "a.part10.rar"
        );
        assert_eq!(
            next_volume_name("a.part99.rar", false).unwrap(),
            "a.part100.rar"
        );
        assert_eq!(
            next_volume_name("Movie.Part2.RAR", false).unwrap(),
            "Movie.Part3.RAR"
        );
    }

    #[test]
    fn test_legacy_naming() {
        assert_eq!(next_volume_name("a.rar", true).unwrap(), "a.r00");
        assert_eq!(next_volume_name("a.r00", true).unwrap(), "a.r01");
        assert_eq!(next_volume_name("a.r09", true).unwrap(), "a.r10");
        assert_eq!(next_volume_name("a.r99", true).unwrap(), "a.s00");
        assert_eq!(next_volume_name("a.s00", true).unwrap(), "a.s01");
    }

    #[test]
    fn test_part_scheme_preferred_over_legacy() {
        // without the legacy hint the part scheme wins
        assert_eq!(
            next_volume_name("x.part2.rar", false).unwrap(),
            "x.part3.rar"
        );
        // with the hint, ".rar" rolls to ".r00"
        assert_eq!(next_volume_name("x.part2.rar", true).unwrap(), "x.part2.r00");
    }

    #[test]
    fn test_unrecognized_pattern() {
        assert_eq!(next_volume_name("archive.bin", false), None);
        assert_eq!(next_volume_name("no_extension", false), None);
        // ".rar" without digits is legacy-style first volume
        assert_eq!(next_volume_name("plain.rar", false).unwrap(), "plain.r00");
    }

    #[test]
    fn test_increment_decimal() {
        assert_eq!(increment_decimal("1"), "2");
        assert_eq!(increment_decimal("09"), "10");
        assert_eq!(increment_decimal("99"), "100");
        assert_eq!(increment_decimal("099"), "100");
        assert_eq!(increment_decimal("999"), "1000");
    }
}
