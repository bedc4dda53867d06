//! Synthetic archive builders shared by the crate's tests.
//!
//! The builders emit minimal but wire-correct store archives in both
//! formats, including multi-volume sets and RAR 5 encrypted entries.

use std::fs;
use std::path::{Path, PathBuf};

use aes::cipher::{BlockEncrypt, KeyInit};

use crate::crypto::rar50::derive_keys;

pub(crate) fn write_vint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Deterministic filler content.
pub(crate) fn pattern_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 7 + i / 251) as u8).collect()
}

// ---------------------------------------------------------------------
// RAR 5 builders
// ---------------------------------------------------------------------

/// Frame a header body: CRC32 + size vint + body.
fn rar5_frame(header_data: &[u8]) -> Vec<u8> {
    let mut block = Vec::new();
    write_vint(&mut block, header_data.len() as u64);
    block.extend_from_slice(header_data);
    let crc = crc32fast::hash(&block);
    let mut out = Vec::new();
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&block);
    out
}

fn rar5_main_block(volume: bool) -> Vec<u8> {
    let mut hd = Vec::new();
    write_vint(&mut hd, 1); // main header
    write_vint(&mut hd, 0); // block flags
    write_vint(&mut hd, if volume { 0x01 } else { 0 }); // archive flags
    rar5_frame(&hd)
}

fn rar5_end_block(next_volume: bool) -> Vec<u8> {
    let mut hd = Vec::new();
    write_vint(&mut hd, 5); // end of archive
    write_vint(&mut hd, 0);
    write_vint(&mut hd, if next_volume { 0x01 } else { 0 });
    rar5_frame(&hd)
}

/// Stored-file block. `file_crc` is the checksum of the complete file.
#[allow(clippy::too_many_arguments)]
fn rar5_file_block(
    name: &str,
    part_data: &[u8],
    file_crc: u32,
    unpacked: u64,
    split_before: bool,
    split_after: bool,
    extra: &[u8],
) -> Vec<u8> {
    let mut flags = 0x0002u64; // data area
    if !extra.is_empty() {
        flags |= 0x0001;
    }
    if split_before {
        flags |= 0x0008;
    }
    if split_after {
        flags |= 0x0010;
    }
    let mut hd = Vec::new();
    write_vint(&mut hd, 2); // file header
    write_vint(&mut hd, flags);
    if !extra.is_empty() {
        write_vint(&mut hd, extra.len() as u64);
    }
    write_vint(&mut hd, part_data.len() as u64);
    write_vint(&mut hd, 0x0004); // file flags: crc32 present
    write_vint(&mut hd, unpacked);
    write_vint(&mut hd, 0o644); // attributes
    hd.extend_from_slice(&file_crc.to_le_bytes());
    write_vint(&mut hd, 0); // compression: stored
    write_vint(&mut hd, 1); // host os: unix
    write_vint(&mut hd, name.len() as u64);
    hd.extend_from_slice(name.as_bytes());
    hd.extend_from_slice(extra);

    let mut out = rar5_frame(&hd);
    out.extend_from_slice(part_data);
    out
}

fn rar5_dir_block(name: &str) -> Vec<u8> {
    let mut hd = Vec::new();
    write_vint(&mut hd, 2);
    write_vint(&mut hd, 0); // no data area
    write_vint(&mut hd, 0x0001); // file flags: directory
    write_vint(&mut hd, 0); // unpacked size
    write_vint(&mut hd, 0o755);
    write_vint(&mut hd, 0); // compression
    write_vint(&mut hd, 1);
    write_vint(&mut hd, name.len() as u64);
    hd.extend_from_slice(name.as_bytes());
    rar5_frame(&hd)
}

/// Single-volume RAR 5 store archive.
pub(crate) fn rar50_store(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
    out.extend_from_slice(&rar5_main_block(false));
    for (name, content) in files {
        out.extend_from_slice(&rar5_file_block(
            name,
            content,
            crc32fast::hash(content),
            content.len() as u64,
            false,
            false,
            &[],
        ));
    }
    out.extend_from_slice(&rar5_end_block(false));
    out
}

/// Single-volume RAR 5 archive containing explicit directory entries.
pub(crate) fn rar50_store_with_dirs(dirs: &[&str], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
    out.extend_from_slice(&rar5_main_block(false));
    for dir in dirs {
        out.extend_from_slice(&rar5_dir_block(dir));
    }
    for (name, content) in files {
        out.extend_from_slice(&rar5_file_block(
            name,
            content,
            crc32fast::hash(content),
            content.len() as u64,
            false,
            false,
            &[],
        ));
    }
    out.extend_from_slice(&rar5_end_block(false));
    out
}

/// Multi-volume RAR 5 set splitting one file at the given chunk sizes.
/// Returns the volume images and the full content.
pub(crate) fn rar50_store_multi(name: &str, chunks: &[usize]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let content = pattern_bytes(chunks.iter().sum());
    let crc = crc32fast::hash(&content);
    let mut vols = Vec::new();
    let mut off = 0;
    for (i, &chunk) in chunks.iter().enumerate() {
        let part = &content[off..off + chunk];
        off += chunk;
        let first = i == 0;
        let last = i == chunks.len() - 1;
        let mut vol = Vec::new();
        vol.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
        vol.extend_from_slice(&rar5_main_block(true));
        vol.extend_from_slice(&rar5_file_block(
            name,
            part,
            crc,
            content.len() as u64,
            !first,
            !last,
            &[],
        ));
        vol.extend_from_slice(&rar5_end_block(!last));
        vols.push(vol);
    }
    (vols, content)
}

/// Write a `base.partN.rar` multi-volume set into `dir`, splitting
/// `content` into equal chunks.
pub(crate) fn write_rar50_multi(
    dir: &Path,
    base: &str,
    name: &str,
    content: &[u8],
    chunk: usize,
) -> Vec<PathBuf> {
    let crc = crc32fast::hash(content);
    let chunks: Vec<&[u8]> = content.chunks(chunk).collect();
    let mut paths = Vec::new();
    for (i, part) in chunks.iter().enumerate() {
        let first = i == 0;
        let last = i == chunks.len() - 1;
        let mut vol = Vec::new();
        vol.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
        vol.extend_from_slice(&rar5_main_block(true));
        vol.extend_from_slice(&rar5_file_block(
            name,
            part,
            crc,
            content.len() as u64,
            !first,
            !last,
            &[],
        ));
        vol.extend_from_slice(&rar5_end_block(!last));
        let path = dir.join(format!("{}.part{}.rar", base, i + 1));
        fs::write(&path, vol).unwrap();
        paths.push(path);
    }
    paths
}

// ---------------------------------------------------------------------
// RAR 5 encryption
// ---------------------------------------------------------------------

fn cbc_encrypt_aes256(key: &[u8; 32], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
    let cipher = aes::Aes256::new_from_slice(key).unwrap();
    let mut data = plain.to_vec();
    while data.len() % 16 != 0 {
        data.push(0);
    }
    let mut prev = *iv;
    for chunk in data.chunks_exact_mut(16) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        let block = aes::cipher::generic_array::GenericArray::from_mut_slice(chunk);
        cipher.encrypt_block(block);
        prev.copy_from_slice(chunk);
    }
    data
}

/// Single-volume RAR 5 archive with one AES-256 encrypted stored file
/// using keyed checksums.
pub(crate) fn rar50_store_encrypted(name: &str, content: &[u8], password: &str) -> Vec<u8> {
    const LG2_COUNT: u8 = 15;
    let salt = [0x5a; 16];
    let iv = [0xa5; 16];
    let keys = derive_keys(password, &salt, LG2_COUNT);

    let cipher_data = cbc_encrypt_aes256(&keys.key, &iv, content);

    // keyed CRC32: HMAC over the digest, folded to 4 bytes
    let digest = crc32fast::hash(content).to_le_bytes();
    let mac = crate::crypto::rar50::hmac_sum(&keys.hash_key, &digest);
    let folded = crate::crypto::rar50::fold_to_crc32(&mac);
    let stored_crc = u32::from_le_bytes(folded);

    // password check value: the 32-byte check value XOR-folded to 8 bytes
    let mut check = [0u8; 8];
    for (i, &b) in keys.check_value.iter().enumerate() {
        check[i % 8] ^= b;
    }

    // crypt extra record: type, version, flags (check | mac), kdf count,
    // salt, iv, check value + 4-byte check digest (unused by readers)
    let mut record = Vec::new();
    write_vint(&mut record, 0x01);
    write_vint(&mut record, 0);
    write_vint(&mut record, 0x01 | 0x02);
    record.push(LG2_COUNT);
    record.extend_from_slice(&salt);
    record.extend_from_slice(&iv);
    record.extend_from_slice(&check);
    record.extend_from_slice(&[0u8; 4]);

    let mut extra = Vec::new();
    write_vint(&mut extra, record.len() as u64);
    extra.extend_from_slice(&record);

    let mut out = Vec::new();
    out.extend_from_slice(b"Rar!\x1a\x07\x01\x00");
    out.extend_from_slice(&rar5_main_block(false));
    out.extend_from_slice(&rar5_file_block(
        name,
        &cipher_data,
        stored_crc,
        content.len() as u64,
        false,
        false,
        &extra,
    ));
    out.extend_from_slice(&rar5_end_block(false));
    out
}

// ---------------------------------------------------------------------
// RAR 1.5 builders
// ---------------------------------------------------------------------

fn crc16(data: &[u8]) -> u16 {
    (crc32fast::hash(data) & 0xffff) as u16
}

fn rar15_block(htype: u8, flags: u16, body: &[u8], data: &[u8]) -> Vec<u8> {
    let size = (7 + body.len()) as u16;
    let mut crc_input = vec![htype];
    crc_input.extend_from_slice(&flags.to_le_bytes());
    crc_input.extend_from_slice(&size.to_le_bytes());
    crc_input.extend_from_slice(body);
    let mut out = Vec::new();
    out.extend_from_slice(&crc16(&crc_input).to_le_bytes());
    out.extend_from_slice(&crc_input);
    out.extend_from_slice(data);
    out
}

fn rar15_main_block(volume: bool) -> Vec<u8> {
    // old-style numbering (.rar → .r00), the scheme legacy sets use
    let flags = if volume { 0x0001u16 } else { 0 };
    rar15_block(0x73, flags, &[0u8; 6], &[])
}

fn rar15_file_body(
    name: &str,
    part_len: u32,
    file_crc: u32,
    unpacked: u32,
) -> Vec<u8> {
    let fname = name.as_bytes();
    let mut body = Vec::new();
    body.extend_from_slice(&part_len.to_le_bytes()); // packed size
    body.extend_from_slice(&unpacked.to_le_bytes());
    body.push(3); // host os: unix
    body.extend_from_slice(&file_crc.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // dos time
    body.push(20); // unpack version
    body.push(b'0'); // method: store
    body.extend_from_slice(&(fname.len() as u16).to_le_bytes());
    body.extend_from_slice(&0o644u32.to_le_bytes());
    body.extend_from_slice(fname);
    body
}

/// Single-volume legacy store archive.
pub(crate) fn rar15_store(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"Rar!\x1a\x07\x00");
    out.extend_from_slice(&rar15_main_block(false));
    for (name, content) in files {
        let body = rar15_file_body(
            name,
            content.len() as u32,
            crc32fast::hash(content),
            content.len() as u32,
        );
        out.extend_from_slice(&rar15_block(0x74, 0x8000, &body, content));
    }
    out.extend_from_slice(&rar15_block(0x7b, 0, &[], &[]));
    out
}

/// Write a legacy `.rar`/`.r00`/... multi-volume set splitting one file.
pub(crate) fn write_rar15_multi(
    dir: &Path,
    base: &str,
    name: &str,
    content: &[u8],
    chunk: usize,
) -> Vec<PathBuf> {
    let crc = crc32fast::hash(content);
    let chunks: Vec<&[u8]> = content.chunks(chunk).collect();
    let mut paths = Vec::new();
    for (i, part) in chunks.iter().enumerate() {
        let first = i == 0;
        let last = i == chunks.len() - 1;
        let mut flags = 0x8000u16;
        if !first {
            flags |= 0x0001; // split before
        }
        if !last {
            flags |= 0x0002; // split after
        }
        let body = rar15_file_body(name, part.len() as u32, crc, content.len() as u32);

        let mut vol = Vec::new();
        vol.extend_from_slice(b"Rar!\x1a\x07\x00");
        vol.extend_from_slice(&rar15_main_block(true));
        vol.extend_from_slice(&rar15_block(0x74, flags, &body, part));
        vol.extend_from_slice(&rar15_block(
            0x7b,
            if last { 0 } else { 0x0001 },
            &[],
            &[],
        ));

        let file_name = if i == 0 {
            format!("{base}.rar")
        } else {
            format!("{base}.r{:02}", i - 1)
        };
        let path = dir.join(file_name);
        fs::write(&path, vol).unwrap();
        paths.push(path);
    }
    paths
}

/// Write any archive image to a file inside `dir`.
pub(crate) fn write_archive(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}
