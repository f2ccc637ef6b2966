//! # parzip
//!
//! A parallel ZIP64 archive engine: create and extract large archives while
//! keeping every core busy. Archives are always written in the ZIP64 form,
//! with per-entry STORE, raw DEFLATE or raw LZMA1 payloads and POSIX
//! metadata (mode, owner, times, symlinks, character devices) carried in
//! the Unix extra field.
//!
//! Packing:
//!
//! ```no_run
//! use parzip::{FileInfo, ZipCreator};
//!
//! let files = vec![FileInfo::from_path("data/report.txt").unwrap()];
//! let mut creator = ZipCreator::new("out.zip");
//! let tc = creator.create(files, 0).unwrap(); // 0 = one thread per core
//! creator.wait();
//! assert_eq!(tc.failures(), 0);
//! ```
//!
//! Unpacking:
//!
//! ```no_run
//! use parzip::ZipFile;
//!
//! let mut archive = ZipFile::open("out.zip").unwrap();
//! let tc = archive.unzip("extracted", 0).unwrap();
//! archive.wait();
//! for i in 0..tc.finished() {
//!     println!("{}", tc.entry(i).unwrap());
//! }
//! ```
//!
//! Both engines run on a dedicated orchestrator thread and report through a
//! shared [`TaskControl`]: an ordered result log ("OK: …" / "FAIL: …"),
//! success and failure counters, and a sticky stop flag that cancels the
//! run at the next chunk boundary.

pub mod bytequeue;
pub mod compress;
pub mod decompress;
pub mod error;
pub mod file;
pub mod fileutils;
pub mod naturalorder;
pub mod pool;
pub mod taskcontrol;
pub mod zipcreator;
pub mod zipdefs;
pub mod zipfile;

pub use bytequeue::{ByteQueue, QueueState};
pub use compress::{compress_entry, CompressResult};
pub use decompress::{unpack_entry, UnpackResult};
pub use error::{Result, ZipError};
pub use fileutils::count_cores;
pub use naturalorder::{natural_compare, natural_less};
pub use taskcontrol::{TaskControl, TaskState};
pub use zipcreator::ZipCreator;
pub use zipdefs::{FileInfo, FileType, UnixExtra};
pub use zipfile::{DirectoryDisplayInfo, FileDisplayInfo, ZipFile};
