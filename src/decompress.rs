//! Per-entry extraction workers for the unpack pipeline.
//!
//! [`unpack_entry`] takes one parsed entry plus its slice of the archive's
//! memory map and recreates the filesystem object under a target prefix.
//! File payloads stream through the codec to a `target$ZIPTMP` side file in
//! 1 MiB chunks, get CRC-verified, and are renamed into place only when they
//! check out; a failed extraction never leaves the temp file behind and
//! never overwrites an existing target.
//!
//! Every failure mode is folded into the returned [`UnpackResult`]; one bad
//! entry does not stop the rest of the archive.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use flate2::{Decompress, FlushDecompress};
use xz2::stream::{Action, Filters, LzmaOptions, Stream};

use crate::compress::CHUNK;
use crate::error::{Result, ZipError};
use crate::fileutils::{create_dirs_for_file, exists_on_fs, mkdirp};
use crate::taskcontrol::TaskControl;
use crate::zipdefs::{
    is_chardev_mode, is_dir_mode, is_reg_mode, is_symlink_mode, CentralHeader, FileType,
    LocalHeader, GP_DATA_DESCRIPTOR, MADE_BY_UNIX, ZIP_DEFLATE, ZIP_LZMA, ZIP_NO_COMPRESSION,
};

/// Suffix of the side file an entry is extracted into before the CRC check.
pub const TMP_SUFFIX: &str = "$ZIPTMP";

/// Outcome of extracting one entry.
#[derive(Debug, Clone)]
pub struct UnpackResult {
    pub ok: bool,
    /// "OK: name" or "FAIL: name\n<reason>", ready for the task log.
    pub message: String,
}

// ── Streaming decoders ───────────────────────────────────────────────────────
// Each returns the CRC-32 of the decompressed bytes.

fn unstore_to_file(data: &[u8], ofile: &mut File, tc: &TaskControl) -> Result<u32> {
    let mut crc = crc32fast::Hasher::new();
    for block in data.chunks(CHUNK) {
        tc.check_stopped()?;
        crc.update(block);
        ofile
            .write_all(block)
            .map_err(|e| ZipError::io("could not write to file", e))?;
    }
    Ok(crc.finalize())
}

fn inflate_to_file(data: &[u8], ofile: &mut File, tc: &TaskControl) -> Result<u32> {
    let mut crc = crc32fast::Hasher::new();
    let mut strm = Decompress::new(false);
    let mut out = vec![0u8; CHUNK];
    let mut pos = 0usize;
    loop {
        let before_in = strm.total_in() as usize;
        let before_out = strm.total_out() as usize;
        let status = strm
            .decompress(&data[pos..], &mut out, FlushDecompress::None)
            .map_err(|e| ZipError::Codec(format!("inflate failed: {e}")))?;
        pos += strm.total_in() as usize - before_in;
        let produced = strm.total_out() as usize - before_out;
        tc.check_stopped()?;
        if produced > 0 {
            crc.update(&out[..produced]);
            ofile
                .write_all(&out[..produced])
                .map_err(|e| ZipError::io("could not write to file", e))?;
        }
        match status {
            flate2::Status::StreamEnd => break,
            // A stream that ends before its data does is caught by the CRC
            // check; bail out instead of spinning.
            _ if pos >= data.len() && produced == 0 => break,
            _ => {}
        }
    }
    Ok(crc.finalize())
}

fn lzma_to_file(data: &[u8], ofile: &mut File, tc: &TaskControl) -> Result<u32> {
    // Entry data opens with the method-14 prelude: two version bytes, the
    // little-endian property length, then the raw LZMA1 properties.
    if data.len() < 4 {
        return Err(ZipError::format("LZMA entry shorter than its prelude"));
    }
    let properties_size = u16::from_le_bytes([data[2], data[3]]) as usize;
    let header_len = 4 + properties_size;
    if properties_size < 5 || data.len() < header_len {
        return Err(ZipError::Codec(
            "could not decode LZMA properties".to_string(),
        ));
    }
    let props = &data[4..header_len];
    let prop_byte = props[0];
    if prop_byte >= 9 * 5 * 5 {
        return Err(ZipError::Codec(
            "could not decode LZMA properties".to_string(),
        ));
    }
    let lc = u32::from(prop_byte % 9);
    let lp = u32::from((prop_byte / 9) % 5);
    let pb = u32::from(prop_byte / 45);
    let dict_size = u32::from_le_bytes([props[1], props[2], props[3], props[4]]);

    let mut opts = LzmaOptions::new_preset(6)
        .map_err(|e| ZipError::Codec(format!("unsupported LZMA preset: {e}")))?;
    opts.dict_size(dict_size)
        .literal_context_bits(lc)
        .literal_position_bits(lp)
        .position_bits(pb);
    let mut filters = Filters::new();
    filters.lzma1(&opts);
    let mut strm = Stream::new_raw_decoder(&filters)
        .map_err(|e| ZipError::Codec(format!("could not initialize LZMA decoder: {e}")))?;

    let mut crc = crc32fast::Hasher::new();
    let mut out = vec![0u8; CHUNK];
    let mut pos = header_len;
    loop {
        let before_in = strm.total_in() as usize;
        let before_out = strm.total_out() as usize;
        let status = strm
            .process(&data[pos..], &mut out, Action::Run)
            .map_err(|e| ZipError::Codec(format!("LZMA decompression failed: {e}")))?;
        pos += strm.total_in() as usize - before_in;
        let produced = strm.total_out() as usize - before_out;
        tc.check_stopped()?;
        if produced > 0 {
            crc.update(&out[..produced]);
            ofile
                .write_all(&out[..produced])
                .map_err(|e| ZipError::io("could not write to file", e))?;
        }
        match status {
            xz2::stream::Status::StreamEnd => break,
            _ if pos >= data.len() && produced == 0 => break,
            _ => {}
        }
    }
    Ok(crc.finalize())
}

// ── Entry routing ────────────────────────────────────────────────────────────

/// Classify an entry. Unix-made archives carry POSIX modes in the upper
/// half of the external attributes; everything else falls back to the
/// trailing-slash convention.
fn detect_filetype(lh: &LocalHeader, ch: &CentralHeader) -> Result<FileType> {
    if ch.version_made_by >> 8 == MADE_BY_UNIX {
        let mode = ch.external_file_attributes >> 16;
        if is_dir_mode(mode) {
            return Ok(FileType::Directory);
        }
        if is_symlink_mode(mode) {
            if ch.compression_method != ZIP_NO_COMPRESSION {
                return Err(ZipError::Unsupported(
                    "symbolic link stored compressed".to_string(),
                ));
            }
            return Ok(FileType::Symlink);
        }
        if is_chardev_mode(mode) {
            return Ok(FileType::CharDevice);
        }
        if is_reg_mode(mode) {
            return Ok(FileType::File);
        }
        return Ok(FileType::Unknown);
    }
    if lh.fname.ends_with('/') {
        return Ok(FileType::Directory);
    }
    Ok(FileType::File)
}

#[cfg(unix)]
fn create_symlink_entry(data: &[u8], outname: &str) -> Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    std::os::unix::fs::symlink(OsStr::from_bytes(data), outname)
        .map_err(|e| ZipError::io(format!("symlink creation failed for {outname}"), e))
}

#[cfg(not(unix))]
fn create_symlink_entry(_data: &[u8], outname: &str) -> Result<()> {
    Err(ZipError::Unsupported(format!(
        "symlinks are not supported on this platform: {outname}"
    )))
}

#[cfg(unix)]
fn create_device(lh: &LocalHeader, outname: &str) -> Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let d = &lh.unix.data;
    if d.len() != 8 {
        return Err(ZipError::format(
            "incorrect extra data for character device",
        ));
    }
    let major = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
    let minor = u32::from_le_bytes([d[4], d[5], d[6], d[7]]);
    mknod(
        Path::new(outname),
        SFlag::S_IFCHR,
        Mode::empty(),
        makedev(u64::from(major), u64::from(minor)),
    )
    .map_err(|e| {
        ZipError::io(
            format!("could not create device node {outname}"),
            std::io::Error::from(e),
        )
    })
}

#[cfg(not(unix))]
fn create_device(_lh: &LocalHeader, outname: &str) -> Result<()> {
    Err(ZipError::Unsupported(format!(
        "character devices are not supported on this platform: {outname}"
    )))
}

fn create_file(
    lh: &LocalHeader,
    ch: &CentralHeader,
    data: &[u8],
    outname: &str,
    tc: &TaskControl,
) -> Result<()> {
    let decoder: fn(&[u8], &mut File, &TaskControl) -> Result<u32> = match ch.compression_method {
        ZIP_NO_COMPRESSION => unstore_to_file,
        ZIP_DEFLATE => inflate_to_file,
        ZIP_LZMA => lzma_to_file,
        other => {
            return Err(ZipError::Unsupported(format!(
                "unsupported compression format {other}"
            )))
        }
    };
    if exists_on_fs(outname) {
        return Err(ZipError::io(
            format!("{outname} already exists, will not overwrite"),
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        ));
    }
    create_dirs_for_file(outname)?;
    let extraction_name = format!("{outname}{TMP_SUFFIX}");
    let mut ofile = File::create(&extraction_name)
        .map_err(|e| ZipError::io(format!("could not create {extraction_name}"), e))?;

    let computed = match decoder(data, &mut ofile, tc) {
        Ok(crc) => crc,
        Err(e) => {
            drop(ofile);
            let _ = std::fs::remove_file(&extraction_name);
            return Err(e);
        }
    };

    // When the sizes live in a trailing data descriptor the local CRC field
    // is not meaningful; the central directory has the real one.
    let stored = if lh.gp_bitflag & GP_DATA_DESCRIPTOR != 0 {
        ch.crc32
    } else {
        lh.crc32
    };
    if computed != stored {
        drop(ofile);
        let _ = std::fs::remove_file(&extraction_name);
        return Err(ZipError::Integrity {
            name: lh.fname.clone(),
            expected: stored,
            actual: computed,
        });
    }
    drop(ofile);
    std::fs::rename(&extraction_name, outname).map_err(|e| {
        let _ = std::fs::remove_file(&extraction_name);
        ZipError::io("could not rename tmp file to target file", e)
    })
}

fn do_unpack(
    lh: &LocalHeader,
    ch: &CentralHeader,
    data: &[u8],
    outname: &str,
    tc: &TaskControl,
) -> Result<()> {
    // Workers run in completion order, so a child entry can land before its
    // directory entry; every path-creating route makes its own parents.
    match detect_filetype(lh, ch)? {
        FileType::Directory => mkdirp(outname),
        FileType::Symlink => {
            create_dirs_for_file(outname)?;
            create_symlink_entry(data, outname)
        }
        FileType::CharDevice => {
            create_dirs_for_file(outname)?;
            create_device(lh, outname)
        }
        FileType::File => create_file(lh, ch, data, outname, tc),
        FileType::Unknown => Err(ZipError::Unsupported("unknown file type".to_string())),
    }
}

/// Restore POSIX metadata after extraction. Any of these can fail for
/// mundane permission reasons, so the results are ignored.
#[cfg(unix)]
fn set_unix_permissions(lh: &LocalHeader, ch: &CentralHeader, path: &str) {
    use std::os::unix::fs::PermissionsExt;

    let mode = ch.external_file_attributes >> 16;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
    // Times and ownership are only trustworthy when the Unix extra was
    // actually present; a zero atime marks its absence.
    if lh.unix.atime != 0 {
        use filetime::FileTime;
        let _ = filetime::set_file_times(
            path,
            FileTime::from_unix_time(i64::from(lh.unix.atime), 0),
            FileTime::from_unix_time(i64::from(lh.unix.mtime), 0),
        );
        use nix::unistd::{chown, Gid, Uid};
        let _ = chown(
            Path::new(path),
            Some(Uid::from_raw(u32::from(lh.unix.uid))),
            Some(Gid::from_raw(u32::from(lh.unix.gid))),
        );
    }
}

#[cfg(not(unix))]
fn set_unix_permissions(_lh: &LocalHeader, _ch: &CentralHeader, _path: &str) {}

/// Extract one entry under `prefix`.
///
/// `data` is the entry's compressed payload, a disjoint slice of the shared
/// archive map. All failures are converted into the result's message; the
/// caller only logs it.
pub fn unpack_entry(
    prefix: &str,
    lh: &LocalHeader,
    ch: &CentralHeader,
    data: &[u8],
    tc: &TaskControl,
) -> UnpackResult {
    let outname = if prefix.is_empty() {
        lh.fname.clone()
    } else if prefix.ends_with('/') {
        format!("{}{}", prefix, lh.fname)
    } else {
        format!("{}/{}", prefix, lh.fname)
    };
    match do_unpack(lh, ch, data, &outname, tc) {
        Ok(()) => {
            if ch.version_made_by >> 8 == MADE_BY_UNIX {
                set_unix_permissions(lh, ch, &outname);
            }
            UnpackResult {
                ok: true,
                message: format!("OK: {}", lh.fname),
            }
        }
        Err(e) => UnpackResult {
            ok: false,
            message: format!("FAIL: {}\n{e}", lh.fname),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{crc32_blocks, lzma1_prelude};
    use crate::zipdefs::NEEDED_VERSION;
    use tempfile::TempDir;

    fn headers(name: &str, method: u16, crc: u32, mode: u32) -> (LocalHeader, CentralHeader) {
        let lh = LocalHeader {
            needed_version: NEEDED_VERSION,
            gp_bitflag: 0x02,
            compression: method,
            crc32: crc,
            fname: name.to_string(),
            ..Default::default()
        };
        let ch = CentralHeader {
            version_made_by: (MADE_BY_UNIX << 8) | NEEDED_VERSION,
            compression_method: method,
            crc32: crc,
            external_file_attributes: mode << 16,
            fname: name.to_string(),
            ..Default::default()
        };
        (lh, ch)
    }

    #[test]
    fn stored_entry_round_trips() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let payload = b"stored payload";
        let (lh, ch) = headers("plain.txt", ZIP_NO_COMPRESSION, crc32_blocks(payload), 0o100644);

        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, payload, &tc);
        assert!(res.ok, "{}", res.message);
        assert_eq!(res.message, "OK: plain.txt");
        let out = std::fs::read(dir.path().join("plain.txt")).unwrap();
        assert_eq!(out, payload);
        assert!(!dir.path().join(format!("plain.txt{TMP_SUFFIX}")).exists());
    }

    #[test]
    fn deflated_entry_round_trips() {
        use flate2::{Compress, Compression, FlushCompress};

        let original: Vec<u8> = b"inflate me. ".iter().cycle().take(50_000).copied().collect();
        let mut strm = Compress::new(Compression::default(), false);
        let mut compressed = vec![0u8; original.len() + 1024];
        let status = strm
            .compress(&original, &mut compressed, FlushCompress::Finish)
            .unwrap();
        assert!(matches!(status, flate2::Status::StreamEnd));
        compressed.truncate(strm.total_out() as usize);

        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let (lh, ch) = headers("text.bin", ZIP_DEFLATE, crc32_blocks(&original), 0o100644);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, &compressed, &tc);
        assert!(res.ok, "{}", res.message);
        assert_eq!(std::fs::read(dir.path().join("text.bin")).unwrap(), original);
    }

    #[test]
    fn lzma_entry_round_trips() {
        use xz2::stream::{Action, Stream};

        let original: Vec<u8> = b"raw lzma payload! "
            .iter()
            .cycle()
            .take(40_000)
            .copied()
            .collect();

        // Encode with the same fixed filter chain the packer uses.
        let mut opts = LzmaOptions::new_preset(6).unwrap();
        opts.dict_size(8 * 1024 * 1024)
            .literal_context_bits(3)
            .literal_position_bits(0)
            .position_bits(2);
        let mut filters = Filters::new();
        filters.lzma1(&opts);
        let mut enc = Stream::new_raw_encoder(&filters).unwrap();
        let mut stream = lzma1_prelude();
        let mut out = vec![0u8; original.len() + 4096];
        let mut pos = 0usize;
        loop {
            let action = if pos == original.len() {
                Action::Finish
            } else {
                Action::Run
            };
            let before_in = enc.total_in() as usize;
            let before_out = enc.total_out() as usize;
            let status = enc.process(&original[pos..], &mut out, action).unwrap();
            pos += enc.total_in() as usize - before_in;
            let produced = enc.total_out() as usize - before_out;
            stream.extend_from_slice(&out[..produced]);
            if matches!(status, xz2::stream::Status::StreamEnd) {
                break;
            }
        }

        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let (lh, ch) = headers("doc.bin", ZIP_LZMA, crc32_blocks(&original), 0o100644);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, &stream, &tc);
        assert!(res.ok, "{}", res.message);
        assert_eq!(std::fs::read(dir.path().join("doc.bin")).unwrap(), original);
    }

    #[test]
    fn crc_mismatch_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let (lh, ch) = headers("bad.txt", ZIP_NO_COMPRESSION, 0xDEAD_BEEF, 0o100644);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, b"some bytes", &tc);
        assert!(!res.ok);
        assert!(res.message.starts_with("FAIL: bad.txt"));
        assert!(!dir.path().join("bad.txt").exists());
        assert!(!dir.path().join(format!("bad.txt{TMP_SUFFIX}")).exists());
    }

    #[test]
    fn existing_target_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let payload = b"second";
        std::fs::write(dir.path().join("dup.txt"), b"first").unwrap();

        let (lh, ch) = headers("dup.txt", ZIP_NO_COMPRESSION, crc32_blocks(payload), 0o100644);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, payload, &tc);
        assert!(!res.ok);
        assert_eq!(std::fs::read(dir.path().join("dup.txt")).unwrap(), b"first");
    }

    #[test]
    fn directory_entry_creates_tree() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let (lh, ch) = headers("sub/dir/", ZIP_NO_COMPRESSION, 0, 0o040755);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, b"", &tc);
        assert!(res.ok, "{}", res.message);
        assert!(dir.path().join("sub/dir").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_entry_restores_link() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let target = b"a";
        let (lh, ch) = headers("link", ZIP_NO_COMPRESSION, crc32_blocks(target), 0o120777);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, target, &tc);
        assert!(res.ok, "{}", res.message);
        let link = dir.path().join("link");
        assert_eq!(std::fs::read_link(&link).unwrap().to_str().unwrap(), "a");
    }

    #[cfg(unix)]
    #[test]
    fn compressed_symlink_is_refused() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let (lh, ch) = headers("link", ZIP_DEFLATE, 0, 0o120777);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, b"xx", &tc);
        assert!(!res.ok);
        assert!(res.message.contains("compressed"));
    }

    #[test]
    fn unsupported_method_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_str().unwrap();
        let (lh, ch) = headers("weird.bin", 93, 0, 0o100644);
        let tc = TaskControl::new();
        let res = unpack_entry(prefix, &lh, &ch, b"zz", &tc);
        assert!(!res.ok);
        assert!(res.message.contains("unsupported compression"));
    }
}
