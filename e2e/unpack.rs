//! End-to-end extraction behaviour: directory trees, symlinks, metadata
//! restore and the refuse-to-overwrite guarantee.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;

use parzip::{FileInfo, TaskState, ZipCreator, ZipFile};
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

fn stat_entry(name: &str) -> FileInfo {
    let mut fi = FileInfo::from_path(name).unwrap();
    fi.unix.atime = 1_577_836_800; // 2020-01-01
    fi.unix.mtime = 1_577_836_800;
    fi
}

/// Build the scenario archive: an explicit directory, a one-byte file and a
/// symlink pointing at it.
fn make_tree_archive(dir: &Path) -> std::path::PathBuf {
    std::fs::create_dir(dir.join("dir")).unwrap();
    std::fs::write(dir.join("dir/a"), b"x").unwrap();
    std::fs::set_permissions(dir.join("dir/a"), std::fs::Permissions::from_mode(0o644)).unwrap();
    std::os::unix::fs::symlink("a", dir.join("dir/link")).unwrap();

    let zip = dir.join("tree.zip");
    in_dir(dir, || {
        let mut creator = ZipCreator::new("tree.zip");
        let files = vec![
            stat_entry("dir"),
            stat_entry("dir/a"),
            stat_entry("dir/link"),
        ];
        let tc = creator.create(files, 2).unwrap();
        creator.wait();
        assert_eq!(
            tc.successes(),
            3,
            "{:?} {:?} {:?}",
            tc.entry(0),
            tc.entry(1),
            tc.entry(2)
        );
    });
    zip
}

#[test]
fn directory_file_and_symlink_come_back() {
    let dir = TempDir::new().unwrap();
    let zip = make_tree_archive(dir.path());

    let mut archive = ZipFile::open(&zip).unwrap();
    assert_eq!(archive.size(), 3);
    // Directory entries pick up their trailing slash at pack time.
    assert_eq!(archive.localheaders()[0].fname, "dir/");

    let out = TempDir::new().unwrap();
    let prefix = out.path().join("x");
    let tc = archive
        .unzip(prefix.to_str().unwrap(), 2)
        .unwrap();
    archive.wait();
    assert_eq!(tc.state(), TaskState::Finished);
    assert_eq!(tc.successes(), 3);
    assert_eq!(tc.failures(), 0);
    for i in 0..3 {
        assert!(tc.entry(i).unwrap().starts_with("OK: "));
    }

    assert!(prefix.join("dir").is_dir());
    assert_eq!(std::fs::read(prefix.join("dir/a")).unwrap(), b"x");
    let link = prefix.join("dir/link");
    let meta = std::fs::symlink_metadata(&link).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(std::fs::read_link(&link).unwrap().to_str().unwrap(), "a");
}

#[test]
fn mode_and_mtime_are_restored() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("exec.sh"), b"#!/bin/sh\n").unwrap();
    std::fs::set_permissions(
        dir.path().join("exec.sh"),
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();

    let zip = dir.path().join("m.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("m.zip");
        let tc = creator.create(vec![stat_entry("exec.sh")], 1).unwrap();
        creator.wait();
        assert_eq!(tc.successes(), 1);
    });

    let out = TempDir::new().unwrap();
    let mut archive = ZipFile::open(&zip).unwrap();
    let tc = archive.unzip(out.path().to_str().unwrap(), 1).unwrap();
    archive.wait();
    assert_eq!(tc.successes(), 1);

    let restored = out.path().join("exec.sh");
    let meta = std::fs::metadata(&restored).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    assert_eq!(mtime.unix_seconds(), 1_577_836_800);
}

/// Unpacking the same archive into the same prefix twice leaves the first
/// extraction untouched and fails every file entry of the second run.
#[test]
fn second_extraction_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    let zip = make_tree_archive(dir.path());

    let out = TempDir::new().unwrap();
    let prefix = out.path().to_str().unwrap().to_string();

    let mut first = ZipFile::open(&zip).unwrap();
    let tc = first.unzip(&prefix, 2).unwrap();
    first.wait();
    assert_eq!(tc.successes(), 3);

    let mut second = ZipFile::open(&zip).unwrap();
    let tc2 = second.unzip(&prefix, 2).unwrap();
    second.wait();
    assert_eq!(tc2.state(), TaskState::Finished);
    // The directory entry is mkdir -p and succeeds again; the file and the
    // symlink both refuse to clobber.
    assert_eq!(tc2.failures(), 2);
    assert_eq!(std::fs::read(out.path().join("dir/a")).unwrap(), b"x");
    assert_eq!(
        std::fs::read_link(out.path().join("dir/link"))
            .unwrap()
            .to_str()
            .unwrap(),
        "a"
    );
}

#[test]
fn unzip_twice_on_same_handle_is_misuse() {
    let dir = TempDir::new().unwrap();
    let zip = make_tree_archive(dir.path());
    let out = TempDir::new().unwrap();

    let mut archive = ZipFile::open(&zip).unwrap();
    archive.unzip(out.path().to_str().unwrap(), 1).unwrap();
    archive.wait();
    let other = TempDir::new().unwrap();
    assert!(archive
        .unzip(other.path().to_str().unwrap(), 1)
        .is_err());
}

#[test]
fn tree_view_matches_contents() {
    let dir = TempDir::new().unwrap();
    let zip = make_tree_archive(dir.path());
    let archive = ZipFile::open(&zip).unwrap();
    let tree = archive.build_tree();
    assert_eq!(tree.dirs.len(), 1);
    assert_eq!(tree.dirs[0].dirname, "dir");
    let names: Vec<&str> = tree.dirs[0]
        .files
        .iter()
        .map(|f| f.fname.as_str())
        .collect();
    assert_eq!(names, vec!["a", "link"]);
}
