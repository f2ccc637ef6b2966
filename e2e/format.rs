//! Parser invariants: structural violations must be fatal at open time.
//!
//! Each test takes a known-good single-entry archive produced by the writer
//! and breaks exactly one invariant by patching bytes.

use std::path::Path;
use std::sync::Mutex;

use parzip::{FileInfo, ZipCreator, ZipError, ZipFile};
use tempfile::TempDir;

static CWD_LOCK: Mutex<()> = Mutex::new(());

fn in_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
    let _guard = CWD_LOCK.lock().unwrap();
    let old = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir).unwrap();
    let out = f();
    std::env::set_current_dir(old).unwrap();
    out
}

/// A minimal valid archive: one stored file "abs.txt" containing "x".
fn make_archive(dir: &Path) -> Vec<u8> {
    std::fs::write(dir.join("abs.txt"), b"x").unwrap();
    in_dir(dir, || {
        let mut creator = ZipCreator::new("one.zip");
        let tc = creator
            .create(vec![FileInfo::from_path("abs.txt").unwrap()], 1)
            .unwrap();
        creator.wait();
        assert_eq!(tc.successes(), 1);
    });
    std::fs::read(dir.join("one.zip")).unwrap()
}

fn write_and_open(dir: &Path, raw: &[u8]) -> parzip::Result<ZipFile> {
    let path = dir.join("patched.zip");
    std::fs::write(&path, raw).unwrap();
    ZipFile::open(&path)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[test]
fn pristine_archive_parses() {
    let dir = TempDir::new().unwrap();
    let raw = make_archive(dir.path());
    let archive = write_and_open(dir.path(), &raw).unwrap();
    assert_eq!(archive.size(), 1);
    assert_eq!(archive.localheaders()[0].fname, "abs.txt");
}

/// Scenario: central directory count disagrees with the local records.
#[test]
fn central_count_mismatch_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut raw = make_archive(dir.path());
    // Splice the single central record out, leaving the locals untouched.
    let central = find_subslice(&raw, b"PK\x01\x02").unwrap();
    let z64_end = find_subslice(&raw, b"PK\x06\x06").unwrap();
    raw.drain(central..z64_end);

    let err = write_and_open(dir.path(), &raw).unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
    assert!(err.to_string().contains("mismatch"), "{err}");
}

#[test]
fn encrypted_entries_are_refused() {
    let dir = TempDir::new().unwrap();
    let mut raw = make_archive(dir.path());
    // General-purpose flag lives at offset 6 of the local header.
    raw[6] |= 0x01;

    let err = write_and_open(dir.path(), &raw).unwrap_err();
    assert!(matches!(err, ZipError::Unsupported(_)), "{err}");
    assert!(err.to_string().contains("encrypted"), "{err}");
}

#[test]
fn absolute_entry_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut raw = make_archive(dir.path());
    // Entry name starts at offset 30; turn "abs.txt" into "/bs.txt".
    assert_eq!(&raw[30..37], b"abs.txt");
    raw[30] = b'/';

    let err = write_and_open(dir.path(), &raw).unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
    assert!(err.to_string().contains("absolute"), "{err}");
}

/// Size sentinels without a ZIP64 extra leave the entry unparseable.
#[test]
fn missing_zip64_extra_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut raw = make_archive(dir.path());
    // The local extra field starts right after the 7-byte name with the
    // ZIP64 tag 0x0001; retag it so the lookup fails.
    let extra_start = 30 + 7;
    assert_eq!(&raw[extra_start..extra_start + 2], &[0x01, 0x00]);
    raw[extra_start] = 0x99;

    let err = write_and_open(dir.path(), &raw).unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
    assert!(err.to_string().contains("ZIP64"), "{err}");
}

#[test]
fn zip64_entry_count_must_match() {
    let dir = TempDir::new().unwrap();
    let mut raw = make_archive(dir.path());
    // total_entries sits 28 bytes into the ZIP64 end record
    // (sig 4 + recordsize 8 + versions 4 + disk numbers 8 + this-disk 8).
    let z64_end = find_subslice(&raw, b"PK\x06\x06").unwrap();
    let total_at = z64_end + 4 + 8 + 2 + 2 + 4 + 4 + 8;
    raw[total_at..total_at + 8].copy_from_slice(&9u64.to_le_bytes());

    let err = write_and_open(dir.path(), &raw).unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
    assert!(err.to_string().contains("zip64"), "{err}");
}

/// The classic end record may carry the 0xFFFF sentinel or the true count;
/// anything else is a broken directory.
#[test]
fn end_record_count_must_match_or_be_sentinel() {
    let dir = TempDir::new().unwrap();
    let mut raw = make_archive(dir.path());
    let eocd = find_subslice(&raw, b"PK\x05\x06").unwrap();
    // total_entries is at offset 10 of the end record.
    raw[eocd + 10..eocd + 12].copy_from_slice(&5u16.to_le_bytes());

    let err = write_and_open(dir.path(), &raw).unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
}

#[test]
fn truncated_archive_is_fatal() {
    let dir = TempDir::new().unwrap();
    let raw = make_archive(dir.path());
    let cut = &raw[..raw.len() - 30];

    let err = write_and_open(dir.path(), cut).unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
}

#[test]
fn garbage_is_not_an_archive() {
    let dir = TempDir::new().unwrap();
    let err = write_and_open(dir.path(), b"this is not a zip file at all...")
        .unwrap_err();
    assert!(matches!(err, ZipError::Format(_)), "{err}");
}
