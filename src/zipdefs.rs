//! ZIP format constants and in-memory record mirrors.
//!
//! Integer fields are host-native; serialization to and from the on-disk
//! little-endian layout is explicit and lives next to the records
//! ([`pack_zip64`], [`pack_unix_extra`], [`find_zip64_sizes`],
//! [`find_unix_extra`]). The writer side of the fixed records is in
//! `zipcreator`, the reader side in `zipfile`.

use crate::error::{Result, ZipError};

// ── Record signatures ────────────────────────────────────────────────────────

pub const LOCAL_SIG: u32 = 0x0403_4b50;
pub const CENTRAL_SIG: u32 = 0x0201_4b50;
pub const CENTRAL_END_SIG: u32 = 0x0605_4b50;
pub const ZIP64_CENTRAL_END_SIG: u32 = 0x0606_4b50;
pub const ZIP64_CENTRAL_LOCATOR_SIG: u32 = 0x0706_4b50;

// ── Compression method codes ─────────────────────────────────────────────────

pub const ZIP_NO_COMPRESSION: u16 = 0;
pub const ZIP_DEFLATE: u16 = 8;
pub const ZIP_LZMA: u16 = 14;

// ── Extra field tags ─────────────────────────────────────────────────────────

pub const ZIP_EXTRA_ZIP64: u16 = 0x0001;
pub const ZIP_EXTRA_UNIX: u16 = 0x000d;

/// Version needed to extract; 6.3 covers LZMA.
pub const NEEDED_VERSION: u16 = 63;

/// Upper byte of `version_made_by` for archives carrying POSIX attributes.
pub const MADE_BY_UNIX: u16 = 3;

/// General-purpose flag written on every entry ("LZMA end-of-stream marker
/// present"); kept identical across all methods for byte-stable output.
pub const GP_BITFLAG: u16 = 0x0002;

/// General-purpose bit 3: sizes and CRC live in a trailing data descriptor.
pub const GP_DATA_DESCRIPTOR: u16 = 1 << 3;

/// General-purpose bit 0: entry is encrypted.
pub const GP_ENCRYPTED: u16 = 1 << 0;

/// LZMA has heavy startup cost and needs some data to get going. Files
/// smaller than this are stored as is.
pub const TOO_SMALL_FOR_LZMA: u64 = 512;

// ── POSIX file-type bits ─────────────────────────────────────────────────────
// The ZIP external attributes carry POSIX mode bits regardless of the host,
// so the masks are spelled out here instead of taken from the platform libc.

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;

pub fn is_reg_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

pub fn is_chardev_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFCHR
}

// ── Entry classification ─────────────────────────────────────────────────────

/// What kind of filesystem object an entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    CharDevice,
    Unknown,
}

// ── Input entries ────────────────────────────────────────────────────────────

/// Unix extra field contents (tag 0x000d): times as 32-bit Unix seconds,
/// owner ids, plus free-form payload bytes (symlink target, device numbers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnixExtra {
    pub atime: u32,
    pub mtime: u32,
    pub uid: u16,
    pub gid: u16,
    pub data: Vec<u8>,
}

/// One entry to pack: a path relative to the working directory, used both to
/// open the source and as the archived name.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Relative path with `/` separators; never empty. The writer does not
    /// validate traversal; the reader rejects absolute names.
    pub name: String,
    pub unix: UnixExtra,
    /// POSIX mode bits including the file type.
    pub mode: u32,
    /// Uncompressed size in bytes; 0 for directories.
    pub size: u64,
    /// Raw device id, meaningful only for character devices.
    pub device_id: u64,
}

// ── On-disk record mirrors ───────────────────────────────────────────────────

/// Local file header. The 32-bit size fields on disk always hold the
/// 0xFFFFFFFF sentinel; the real values live in the ZIP64 extra and are
/// carried here as 64-bit numbers.
#[derive(Debug, Clone, Default)]
pub struct LocalHeader {
    pub needed_version: u16,
    pub gp_bitflag: u16,
    pub compression: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub fname: String,
    pub extra: Vec<u8>,
    pub unix: UnixExtra,
}

/// Central directory entry.
#[derive(Debug, Clone, Default)]
pub struct CentralHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub bit_flag: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number_start: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub local_header_rel_offset: u64,
    pub fname: String,
    pub extra_field: Vec<u8>,
    pub comment: Vec<u8>,
}

/// ZIP64 end-of-central-directory record.
#[derive(Debug, Clone, Default)]
pub struct Zip64EndRecord {
    pub recordsize: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub dir_start_disk_number: u32,
    pub this_disk_num_entries: u64,
    pub total_entries: u64,
    pub dir_size: u64,
    pub dir_offset: u64,
    pub extensible: Vec<u8>,
}

/// ZIP64 end-of-central-directory locator.
#[derive(Debug, Clone, Default)]
pub struct Zip64Locator {
    pub central_dir_disk_number: u32,
    pub central_dir_offset: u64,
    pub num_disks: u32,
}

/// Classic end-of-central-directory record; every count and size holds a
/// sentinel, the real values are in the ZIP64 record.
#[derive(Debug, Clone, Default)]
pub struct EndRecord {
    pub disk_number: u16,
    pub central_dir_disk_number: u16,
    pub this_disk_num_entries: u16,
    pub total_entries: u16,
    pub dir_size: u32,
    pub dir_offset_start_disk: u32,
    pub comment: Vec<u8>,
}

// ── Extra-field serialization ────────────────────────────────────────────────

/// Fixed payload size of the ZIP64 extended-information extra field.
pub const ZIP64_EXTRA_SIZE: u16 = 8 + 8 + 8 + 4;

/// Build the ZIP64 extended-information extra field (tag 0x0001, 28 payload
/// bytes: uncompressed size, compressed size, local header offset, disk 0).
pub fn pack_zip64(uncompressed_size: u64, compressed_size: u64, offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ZIP64_EXTRA_SIZE as usize);
    out.extend_from_slice(&ZIP_EXTRA_ZIP64.to_le_bytes());
    out.extend_from_slice(&ZIP64_EXTRA_SIZE.to_le_bytes());
    out.extend_from_slice(&uncompressed_size.to_le_bytes());
    out.extend_from_slice(&compressed_size.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Build the Unix extra field (tag 0x000d): atime, mtime, uid, gid, payload.
pub fn pack_unix_extra(ue: &UnixExtra) -> Vec<u8> {
    let size = (4 + 4 + 2 + 2 + ue.data.len()) as u16;
    let mut out = Vec::with_capacity(4 + size as usize);
    out.extend_from_slice(&ZIP_EXTRA_UNIX.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&ue.atime.to_le_bytes());
    out.extend_from_slice(&ue.mtime.to_le_bytes());
    out.extend_from_slice(&ue.uid.to_le_bytes());
    out.extend_from_slice(&ue.gid.to_le_bytes());
    out.extend_from_slice(&ue.data);
    out
}

fn le16(b: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(off..off + 2)?.try_into().ok()?))
}

fn le32(b: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(off..off + 4)?.try_into().ok()?))
}

fn le64(b: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(off..off + 8)?.try_into().ok()?))
}

/// Pull the 64-bit sizes out of a ZIP64 extended-information extra field.
///
/// Mandatory for any entry whose 32-bit size fields hold the 0xFFFFFFFF
/// sentinel; its absence is a format error.
pub fn find_zip64_sizes(extra: &[u8]) -> Result<(u64, u64)> {
    let mut off = 0usize;
    while let (Some(id), Some(size)) = (le16(extra, off), le16(extra, off + 2)) {
        off += 4;
        if id == ZIP_EXTRA_ZIP64 {
            let uncompressed = le64(extra, off);
            let compressed = le64(extra, off + 8);
            return match (uncompressed, compressed) {
                (Some(u), Some(c)) => Ok((c, u)),
                _ => Err(ZipError::format("truncated ZIP64 extra field")),
            };
        }
        off += size as usize;
    }
    Err(ZipError::format(
        "entry extra field does not contain the ZIP64 extension",
    ))
}

/// Pull the Unix extra field out of an entry's extra bytes. Entries written
/// by non-Unix tools have none; all fields are then zero.
pub fn find_unix_extra(extra: &[u8]) -> UnixExtra {
    let mut off = 0usize;
    while let (Some(id), Some(size)) = (le16(extra, off), le16(extra, off + 2)) {
        off += 4;
        let size = size as usize;
        let end = (off + size).min(extra.len());
        if id == ZIP_EXTRA_UNIX && size >= 12 && end >= off + 12 {
            if let (Some(atime), Some(mtime), Some(uid), Some(gid)) = (
                le32(extra, off),
                le32(extra, off + 4),
                le16(extra, off + 8),
                le16(extra, off + 10),
            ) {
                return UnixExtra {
                    atime,
                    mtime,
                    uid,
                    gid,
                    data: extra[off + 12..end].to_vec(),
                };
            }
        }
        off += size;
    }
    UnixExtra::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip64_extra_layout() {
        let extra = pack_zip64(14, 0xFFFF_FFFF, 0);
        assert_eq!(extra.len(), 4 + 28);
        assert_eq!(&extra[0..2], &[0x01, 0x00]);
        assert_eq!(&extra[2..4], &[28, 0]);
        let (csize, usize_) = find_zip64_sizes(&extra).unwrap();
        assert_eq!(usize_, 14);
        assert_eq!(csize, 0xFFFF_FFFF);
    }

    #[test]
    fn unix_extra_round_trip() {
        let ue = UnixExtra {
            atime: 1_600_000_000,
            mtime: 1_600_000_123,
            uid: 1000,
            gid: 100,
            data: b"target".to_vec(),
        };
        let packed = pack_unix_extra(&ue);
        assert_eq!(packed.len(), 4 + 12 + 6);
        let parsed = find_unix_extra(&packed);
        assert_eq!(parsed, ue);
    }

    #[test]
    fn unix_extra_found_after_zip64() {
        let mut extra = pack_zip64(1, 1, 0);
        let ue = UnixExtra {
            atime: 7,
            mtime: 8,
            uid: 9,
            gid: 10,
            data: Vec::new(),
        };
        extra.extend_from_slice(&pack_unix_extra(&ue));
        assert_eq!(find_unix_extra(&extra), ue);
        assert!(find_zip64_sizes(&extra).is_ok());
    }

    #[test]
    fn missing_zip64_is_format_error() {
        let ue = pack_unix_extra(&UnixExtra::default());
        assert!(matches!(find_zip64_sizes(&ue), Err(ZipError::Format(_))));
    }

    #[test]
    fn mode_classifiers() {
        assert!(is_reg_mode(0o100644));
        assert!(is_dir_mode(0o040755));
        assert!(is_symlink_mode(0o120777));
        assert!(is_chardev_mode(0o020660));
        assert!(!is_reg_mode(0o040755));
    }
}
