//! Filesystem queries and path helpers shared by the pack and unpack paths.
//!
//! - [`FileInfo::from_path`] — stat one entry into the packer's input record
//! - [`is_absolute_path`]    — multi-platform absolute-path test
//! - [`mkdirp`] / [`create_dirs_for_file`] — recursive directory creation
//! - [`exists_on_fs`]        — symlink-aware existence check
//! - [`count_cores`]         — logical core count, always ≥ 1
//!
//! Recursive directory expansion is deliberately absent: callers hand the
//! engine a ready-made entry list.

use std::path::Path;

use crate::error::{Result, ZipError};
use crate::zipdefs::{FileInfo, UnixExtra};

impl FileInfo {
    /// Stat a filesystem entry (without following symlinks) into a packer
    /// input record. `name` doubles as the archived name and the path the
    /// compression worker opens, so it should be relative to the working
    /// directory.
    #[cfg(unix)]
    pub fn from_path(name: impl Into<String>) -> Result<FileInfo> {
        use nix::sys::stat::lstat;

        let name = name.into();
        let st = lstat(Path::new(&name)).map_err(|e| {
            ZipError::io(
                format!("could not get entry stats for {name}"),
                std::io::Error::from(e),
            )
        })?;
        Ok(FileInfo {
            unix: UnixExtra {
                atime: st.st_atime as u32,
                mtime: st.st_mtime as u32,
                uid: st.st_uid as u16,
                gid: st.st_gid as u16,
                data: Vec::new(),
            },
            mode: st.st_mode as u32,
            size: st.st_size as u64,
            device_id: st.st_rdev as u64,
            name,
        })
    }

    /// Fallback for targets without `lstat`: regular files and directories
    /// only, with synthetic POSIX modes.
    #[cfg(not(unix))]
    pub fn from_path(name: impl Into<String>) -> Result<FileInfo> {
        use crate::zipdefs::{S_IFDIR, S_IFREG};

        let name = name.into();
        let md = std::fs::metadata(&name)
            .map_err(|e| ZipError::io(format!("could not get entry stats for {name}"), e))?;
        let mode = if md.is_dir() {
            S_IFDIR | 0o755
        } else {
            S_IFREG | 0o644
        };
        Ok(FileInfo {
            unix: UnixExtra::default(),
            mode,
            size: md.len(),
            device_id: 0,
            name,
        })
    }
}

/// Absolute in the eyes of any platform an archive might travel to: a
/// leading `/` or `\`, or a drive prefix like `C:/`. The platform's own
/// definition is not enough because archives are exchanged across systems.
pub fn is_absolute_path(fname: &str) -> bool {
    let bytes = fname.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    if bytes[0] == b'/' || bytes[0] == b'\\' {
        return true;
    }
    bytes.len() > 2 && bytes[1] == b':' && (bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Create a directory and all missing parents.
pub fn mkdirp(path: &str) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| ZipError::io(format!("could not create directory {path}"), e))
}

/// Create the parent directories a file at `path` needs.
pub fn create_dirs_for_file(path: &str) -> Result<()> {
    match path.rfind('/') {
        None | Some(0) => Ok(()),
        Some(idx) => mkdirp(&path[..idx]),
    }
}

/// True when something (file, dir, dangling symlink) exists at `path`.
pub fn exists_on_fs(path: &str) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Logical CPU cores, falling back to 1 when the query fails.
pub fn count_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zipdefs::{is_dir_mode, is_reg_mode};

    #[test]
    fn absolute_path_variants() {
        assert!(is_absolute_path("/etc/passwd"));
        assert!(is_absolute_path("\\share\\x"));
        assert!(is_absolute_path("C:/Users/x"));
        assert!(is_absolute_path("c:\\x"));
        assert!(!is_absolute_path("relative/path"));
        assert!(!is_absolute_path("a:b"));
        assert!(!is_absolute_path(""));
    }

    #[test]
    fn create_dirs_for_file_handles_flat_names() {
        // Names without a slash need no directories at all.
        create_dirs_for_file("plain.txt").unwrap();
    }

    #[test]
    fn stat_fills_type_and_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"12345").unwrap();

        let fi = FileInfo::from_path(file.to_str().unwrap()).unwrap();
        assert!(is_reg_mode(fi.mode));
        assert_eq!(fi.size, 5);

        let di = FileInfo::from_path(dir.path().to_str().unwrap()).unwrap();
        assert!(is_dir_mode(di.mode));
    }

    #[test]
    fn exists_sees_dangling_symlinks() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(!exists_on_fs(missing.to_str().unwrap()));

        #[cfg(unix)]
        {
            let link = dir.path().join("dangle");
            std::os::unix::fs::symlink("nowhere", &link).unwrap();
            assert!(exists_on_fs(link.to_str().unwrap()));
        }
    }

    #[test]
    fn count_cores_at_least_one() {
        assert!(count_cores() >= 1);
    }
}
