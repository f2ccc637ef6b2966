//! Per-entry compression workers for the pack pipeline.
//!
//! [`compress_entry`] runs synchronously on the calling thread: it reads one
//! filesystem entry, feeds its payload through the selected codec and pushes
//! the output into the task's [`ByteQueue`] in 1 MiB chunks. The orchestrator
//! spawns one worker per in-flight entry and drains the queue on the other
//! side.
//!
//! Regular files pick their codec by size and probe result:
//!
//! | entry                    | routine                                 |
//! |--------------------------|-----------------------------------------|
//! | regular, < 512 bytes     | store                                   |
//! | regular, otherwise       | lzma (if enabled, probe passes) or deflate |
//! | directory                | no payload                              |
//! | symlink                  | target bytes, stored                    |
//! | char device (POSIX)      | no payload, device numbers in the extra |
//!
//! Workers poll the stop flag between chunks; a cancelled worker returns
//! `Err(Stopped)` and the orchestrator shuts the queue down.

use std::fs::File;

use flate2::{Compress, Compression, FlushCompress, Status};
use xz2::stream::{Action, Filters, LzmaOptions, Stream};

use crate::bytequeue::ByteQueue;
use crate::error::{Result, ZipError};
use crate::file::map_file;
use crate::taskcontrol::TaskControl;
use crate::zipdefs::{
    is_chardev_mode, is_dir_mode, is_reg_mode, is_symlink_mode, FileInfo, FileType,
    TOO_SMALL_FOR_LZMA, ZIP_DEFLATE, ZIP_LZMA, ZIP_NO_COMPRESSION,
};

/// Codec streaming granularity. Also the CRC-32 block size.
pub const CHUNK: usize = 1024 * 1024;

// LZMA1 parameters, fixed so the emitted properties (and the archive bytes)
// are deterministic. These are the liblzma defaults for preset 6.
const LZMA_PRESET: u32 = 6;
const LZMA_DICT_SIZE: u32 = 8 * 1024 * 1024;
const LZMA_LC: u8 = 3;
const LZMA_LP: u8 = 0;
const LZMA_PB: u8 = 2;

/// Output of compressing one entry; everything the archive writer needs to
/// finish the entry's headers.
#[derive(Debug, Clone)]
pub struct CompressResult {
    pub entry_type: FileType,
    pub crc32: u32,
    /// ZIP method code: 0, 8 or 14.
    pub compression: u16,
    /// Bytes prepended to the entry's Unix extra field (symlink target,
    /// device major/minor).
    pub extra_unix_bytes: Vec<u8>,
}

/// CRC-32 of `buf`, fed to the hasher in 1 MiB blocks.
pub fn crc32_blocks(buf: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    for block in buf.chunks(CHUNK) {
        h.update(block);
    }
    h.finalize()
}

/// The 5 LZMA1 property bytes: packed lc/lp/pb followed by the dictionary
/// size, little-endian.
fn lzma1_properties() -> [u8; 5] {
    let mut props = [0u8; 5];
    props[0] = (LZMA_PB * 5 + LZMA_LP) * 9 + LZMA_LC;
    props[1..5].copy_from_slice(&LZMA_DICT_SIZE.to_le_bytes());
    props
}

/// The stream prelude emitted before raw LZMA1 data in a ZIP entry:
/// two version bytes, the little-endian property length, the properties.
/// Readers reinitialise their decoder from exactly these bytes, so the
/// layout must match what other ZIP writers emit for method 14.
pub fn lzma1_prelude() -> Vec<u8> {
    let props = lzma1_properties();
    let mut prelude = Vec::with_capacity(4 + props.len());
    prelude.push(0x09);
    prelude.push(0x04);
    prelude.extend_from_slice(&(props.len() as u16).to_le_bytes());
    prelude.extend_from_slice(&props);
    prelude
}

fn lzma1_filters() -> Result<Filters> {
    let mut opts = LzmaOptions::new_preset(LZMA_PRESET)
        .map_err(|e| ZipError::Codec(format!("unsupported LZMA preset: {e}")))?;
    opts.dict_size(LZMA_DICT_SIZE)
        .literal_context_bits(u32::from(LZMA_LC))
        .literal_position_bits(u32::from(LZMA_LP))
        .position_bits(u32::from(LZMA_PB));
    let mut filters = Filters::new();
    filters.lzma1(&opts);
    Ok(filters)
}

fn open_input(fi: &FileInfo) -> Result<File> {
    File::open(&fi.name)
        .map_err(|e| ZipError::io(format!("could not open input file {}", fi.name), e))
}

/// Probe whether DEFLATE can shrink this data meaningfully.
///
/// Compresses up to 32 KiB taken from the buffer midpoint (files usually
/// start with compressible index-like data, the middle is more honest) and
/// requires the output to stay below 0.92× the input.
fn is_compressible(buf: &[u8]) -> Result<bool> {
    const REQUIRED_RATIO: f64 = 0.92;
    let blocksize = (32 * 1024).min(buf.len() / 2);
    if blocksize < 16 {
        return Ok(false);
    }
    let probe = &buf[buf.len() / 2..buf.len() / 2 + blocksize];
    let mut out = vec![0u8; 2 * blocksize];
    let mut strm = Compress::new(Compression::default(), true);
    let status = strm
        .compress(probe, &mut out, FlushCompress::Finish)
        .map_err(|e| ZipError::Codec(format!("compression probe failed: {e}")))?;
    if !matches!(status, Status::StreamEnd) {
        return Err(ZipError::Codec(
            "compression probe did not complete".to_string(),
        ));
    }
    Ok((strm.total_out() as f64) / (blocksize as f64) < REQUIRED_RATIO)
}

fn store_file(fi: &FileInfo, queue: &ByteQueue) -> Result<CompressResult> {
    let infile = open_input(fi)?;
    // A zero-length file cannot be mapped; it also has nothing to push.
    let size = infile
        .metadata()
        .map_err(|e| ZipError::io(format!("could not stat {}", fi.name), e))?
        .len();
    let mut result = CompressResult {
        entry_type: FileType::File,
        crc32: 0,
        compression: ZIP_NO_COMPRESSION,
        extra_unix_bytes: Vec::new(),
    };
    if size == 0 {
        return Ok(result);
    }
    let buf = map_file(&infile)?;
    result.crc32 = crc32_blocks(&buf);
    queue.push(&buf)?;
    Ok(result)
}

fn deflate_file(fi: &FileInfo, queue: &ByteQueue, tc: &TaskControl) -> Result<CompressResult> {
    let infile = open_input(fi)?;
    let buf = map_file(&infile)?;
    let result = CompressResult {
        entry_type: FileType::File,
        crc32: crc32_blocks(&buf),
        compression: ZIP_DEFLATE,
        extra_unix_bytes: Vec::new(),
    };

    // Raw DEFLATE stream, no zlib wrapper (the ZIP wbits = -15 form).
    let mut strm = Compress::new(Compression::default(), false);
    let mut out = vec![0u8; CHUNK];
    let mut pos = 0usize;
    loop {
        let before_in = strm.total_in() as usize;
        let before_out = strm.total_out() as usize;
        let status = strm
            .compress(&buf[pos..], &mut out, FlushCompress::Finish)
            .map_err(|e| ZipError::Codec(format!("deflate failed: {e}")))?;
        let consumed = strm.total_in() as usize - before_in;
        let produced = strm.total_out() as usize - before_out;
        pos += consumed;
        tc.check_stopped()?;
        if produced > 0 {
            queue.push(&out[..produced])?;
        }
        match status {
            Status::StreamEnd => break,
            Status::Ok => {}
            Status::BufError => {
                if consumed == 0 && produced == 0 {
                    return Err(ZipError::Codec("deflate made no progress".to_string()));
                }
            }
        }
    }
    Ok(result)
}

fn lzma_file(fi: &FileInfo, queue: &ByteQueue, tc: &TaskControl) -> Result<CompressResult> {
    let infile = open_input(fi)?;
    let buf = map_file(&infile)?;
    if !is_compressible(&buf)? {
        return store_file(fi, queue);
    }
    let result = CompressResult {
        entry_type: FileType::File,
        crc32: crc32_blocks(&buf),
        compression: ZIP_LZMA,
        extra_unix_bytes: Vec::new(),
    };

    queue.push(&lzma1_prelude())?;

    let filters = lzma1_filters()?;
    let mut strm = Stream::new_raw_encoder(&filters)
        .map_err(|e| ZipError::Codec(format!("could not create LZMA encoder: {e}")))?;
    let mut out = vec![0u8; CHUNK];
    let mut pos = 0usize;
    loop {
        let action = if pos == buf.len() {
            Action::Finish
        } else {
            Action::Run
        };
        let before_in = strm.total_in() as usize;
        let before_out = strm.total_out() as usize;
        let status = strm
            .process(&buf[pos..], &mut out, action)
            .map_err(|e| ZipError::Codec(format!("LZMA compression failed: {e}")))?;
        pos += strm.total_in() as usize - before_in;
        let produced = strm.total_out() as usize - before_out;
        tc.check_stopped()?;
        if produced > 0 {
            queue.push(&out[..produced])?;
        }
        if matches!(status, xz2::stream::Status::StreamEnd) {
            break;
        }
    }
    Ok(result)
}

fn create_dir() -> CompressResult {
    CompressResult {
        entry_type: FileType::Directory,
        crc32: 0,
        compression: ZIP_NO_COMPRESSION,
        extra_unix_bytes: Vec::new(),
    }
}

#[cfg(unix)]
fn create_symlink(fi: &FileInfo, queue: &ByteQueue) -> Result<CompressResult> {
    use std::os::unix::ffi::OsStrExt;

    let target = std::fs::read_link(&fi.name)
        .map_err(|e| ZipError::io(format!("could not read symlink {}", fi.name), e))?;
    let target = target.as_os_str().as_bytes().to_vec();
    if target.len() as u64 > fi.size {
        return Err(ZipError::Unsupported(format!(
            "symlink {} changed while packing",
            fi.name
        )));
    }
    // The ZIP format wants the target in the Unix extra data, but most
    // tools put it in the file data. Do both to be sure.
    let result = CompressResult {
        entry_type: FileType::Symlink,
        crc32: crc32_blocks(&target),
        compression: ZIP_NO_COMPRESSION,
        extra_unix_bytes: target.clone(),
    };
    queue.push(&target)?;
    Ok(result)
}

#[cfg(unix)]
fn create_chrdev(fi: &FileInfo) -> CompressResult {
    use nix::sys::stat::{major, minor};

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&(major(fi.device_id) as u32).to_le_bytes());
    data.extend_from_slice(&(minor(fi.device_id) as u32).to_le_bytes());
    CompressResult {
        entry_type: FileType::CharDevice,
        crc32: 0,
        compression: ZIP_NO_COMPRESSION,
        extra_unix_bytes: data,
    }
}

/// Compress one entry into `queue`, dispatching on the entry's file type.
///
/// Does not shut the queue down; the spawning orchestrator owns that, so the
/// shutdown also happens when the worker fails.
pub fn compress_entry(
    fi: &FileInfo,
    queue: &ByteQueue,
    use_lzma: bool,
    tc: &TaskControl,
) -> Result<CompressResult> {
    if is_reg_mode(fi.mode) {
        if fi.size < TOO_SMALL_FOR_LZMA {
            return store_file(fi, queue);
        }
        return if use_lzma {
            lzma_file(fi, queue, tc)
        } else {
            deflate_file(fi, queue, tc)
        };
    }
    if is_dir_mode(fi.mode) {
        return Ok(create_dir());
    }
    if is_symlink_mode(fi.mode) {
        #[cfg(unix)]
        return create_symlink(fi, queue);
        #[cfg(not(unix))]
        return Err(ZipError::Unsupported(format!(
            "symlinks are not supported on this platform: {}",
            fi.name
        )));
    }
    if is_chardev_mode(fi.mode) {
        #[cfg(unix)]
        return Ok(create_chrdev(fi));
        #[cfg(not(unix))]
        return Err(ZipError::Unsupported(format!(
            "character devices are not supported on this platform: {}",
            fi.name
        )));
    }
    Err(ZipError::Unsupported(format!(
        "unknown file type: {}",
        fi.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zipdefs::S_IFREG;
    use flate2::{Decompress, FlushDecompress};
    use tempfile::TempDir;

    fn file_info(path: &std::path::Path, size: u64) -> FileInfo {
        FileInfo {
            name: path.to_str().unwrap().to_string(),
            unix: Default::default(),
            mode: S_IFREG | 0o644,
            size,
            device_id: 0,
        }
    }

    /// Deterministic pseudo-random bytes; incompressible for all practical
    /// purposes.
    fn xorshift_bytes(n: usize) -> Vec<u8> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(n);
        out
    }

    #[test]
    fn lzma_prelude_bytes() {
        assert_eq!(
            lzma1_prelude(),
            vec![0x09, 0x04, 0x05, 0x00, 0x5d, 0x00, 0x00, 0x80, 0x00]
        );
    }

    #[test]
    fn crc_matches_reference_value() {
        // IEEE CRC-32 of "123456789" is the classic check value.
        assert_eq!(crc32_blocks(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32_blocks(b""), 0);
    }

    #[test]
    fn probe_accepts_zeros_rejects_noise() {
        let zeros = vec![0u8; 64 * 1024];
        assert!(is_compressible(&zeros).unwrap());
        let noise = xorshift_bytes(64 * 1024);
        assert!(!is_compressible(&noise).unwrap());
        // Too small to probe at all.
        assert!(!is_compressible(&[1, 2, 3]).unwrap());
    }

    #[test]
    fn store_small_file_pushes_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"hello store").unwrap();

        let queue = ByteQueue::new(1024);
        let tc = TaskControl::new();
        let fi = file_info(&path, 11);
        let res = compress_entry(&fi, &queue, true, &tc).unwrap();
        queue.shutdown();

        assert_eq!(res.compression, ZIP_NO_COMPRESSION);
        assert_eq!(res.crc32, crc32_blocks(b"hello store"));
        assert_eq!(queue.pop(), b"hello store");
    }

    #[test]
    fn empty_file_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let queue = ByteQueue::new(64);
        let tc = TaskControl::new();
        let res = compress_entry(&file_info(&path, 0), &queue, true, &tc).unwrap();
        queue.shutdown();
        assert_eq!(res.compression, ZIP_NO_COMPRESSION);
        assert_eq!(res.crc32, 0);
        assert!(queue.pop().is_empty());
    }

    #[test]
    fn deflate_stream_inflates_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("text.bin");
        let original: Vec<u8> = b"compressible text. ".iter().cycle().take(100_000).copied().collect();
        std::fs::write(&path, &original).unwrap();

        let queue = ByteQueue::new(4 * 1024 * 1024);
        let tc = TaskControl::new();
        let fi = file_info(&path, original.len() as u64);
        let res = compress_entry(&fi, &queue, false, &tc).unwrap();
        queue.shutdown();
        let compressed = queue.pop();

        assert_eq!(res.compression, ZIP_DEFLATE);
        assert!(compressed.len() < original.len());

        // Raw inflate must reproduce the input.
        let mut strm = Decompress::new(false);
        let mut recovered = vec![0u8; original.len() + 16];
        let status = strm
            .decompress(&compressed, &mut recovered, FlushDecompress::Finish)
            .unwrap();
        assert!(matches!(status, flate2::Status::StreamEnd));
        recovered.truncate(strm.total_out() as usize);
        assert_eq!(recovered, original);
        assert_eq!(res.crc32, crc32_blocks(&original));
    }

    #[test]
    fn lzma_falls_back_to_store_on_noise() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noise.bin");
        let noise = xorshift_bytes(100 * 1024);
        std::fs::write(&path, &noise).unwrap();

        let queue = ByteQueue::new(4 * 1024 * 1024);
        let tc = TaskControl::new();
        let fi = file_info(&path, noise.len() as u64);
        let res = compress_entry(&fi, &queue, true, &tc).unwrap();
        queue.shutdown();

        assert_eq!(res.compression, ZIP_NO_COMPRESSION);
        assert_eq!(queue.pop(), noise);
    }

    #[test]
    fn lzma_stream_starts_with_prelude() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("text.bin");
        let original: Vec<u8> = b"lzma likes repetitive input. "
            .iter()
            .cycle()
            .take(64 * 1024)
            .copied()
            .collect();
        std::fs::write(&path, &original).unwrap();

        let queue = ByteQueue::new(4 * 1024 * 1024);
        let tc = TaskControl::new();
        let fi = file_info(&path, original.len() as u64);
        let res = compress_entry(&fi, &queue, true, &tc).unwrap();
        queue.shutdown();
        let compressed = queue.pop();

        assert_eq!(res.compression, ZIP_LZMA);
        assert!(compressed.starts_with(&lzma1_prelude()));
        assert!(compressed.len() < original.len());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let fi = FileInfo {
            name: "sock".to_string(),
            unix: Default::default(),
            mode: 0o140000 | 0o644, // socket
            size: 0,
            device_id: 0,
        };
        let queue = ByteQueue::new(64);
        let tc = TaskControl::new();
        let err = compress_entry(&fi, &queue, true, &tc).unwrap_err();
        queue.shutdown();
        assert!(matches!(err, ZipError::Unsupported(_)));
    }

    #[test]
    fn cancelled_worker_returns_stopped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = b"cancel me please ".iter().cycle().take(256 * 1024).copied().collect();
        std::fs::write(&path, &data).unwrap();

        let queue = ByteQueue::new(16 * 1024 * 1024);
        let tc = TaskControl::new();
        tc.stop();
        let fi = file_info(&path, data.len() as u64);
        let err = compress_entry(&fi, &queue, false, &tc).unwrap_err();
        queue.shutdown();
        queue.pop();
        assert!(matches!(err, ZipError::Stopped));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_target_is_payload_and_extra() {
        use crate::zipdefs::S_IFLNK;

        let dir = TempDir::new().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("over/there", &link).unwrap();

        let queue = ByteQueue::new(1024);
        let tc = TaskControl::new();
        let fi = FileInfo {
            name: link.to_str().unwrap().to_string(),
            unix: Default::default(),
            mode: S_IFLNK | 0o777,
            size: "over/there".len() as u64,
            device_id: 0,
        };
        let res = compress_entry(&fi, &queue, true, &tc).unwrap();
        queue.shutdown();

        assert_eq!(res.entry_type, FileType::Symlink);
        assert_eq!(res.compression, ZIP_NO_COMPRESSION);
        assert_eq!(res.extra_unix_bytes, b"over/there");
        assert_eq!(queue.pop(), b"over/there");
    }
}
