//! Archive reader and parallel unpack engine.
//!
//! [`ZipFile::open`] memory-maps the archive and walks it linearly: local
//! file records, central directory, optional ZIP64 trailer records, end
//! record. The parsed index (headers plus per-entry data offsets) lives for
//! the archive's lifetime; the map used by unpack workers is taken fresh in
//! [`ZipFile::unzip`] and shared read-only.
//!
//! Structural invariants are enforced at parse time and are fatal: local
//! and central entry counts must match, the ZIP64 record's count must match,
//! the end record's count must match or be the 0xFFFF sentinel, encrypted
//! entries are refused, entry names must be relative and non-empty, and any
//! entry with 32-bit size sentinels must carry a ZIP64 extra field.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::decompress::{unpack_entry, UnpackResult};
use crate::error::{Result, ZipError};
use crate::file::{map_file, ByteReader};
use crate::fileutils::{count_cores, is_absolute_path};
use crate::naturalorder::natural_compare;
use crate::pool::WorkerPool;
use crate::taskcontrol::{TaskControl, TaskState};
use crate::zipdefs::{
    find_unix_extra, find_zip64_sizes, CentralHeader, EndRecord, LocalHeader, Zip64EndRecord,
    Zip64Locator, CENTRAL_END_SIG, CENTRAL_SIG, GP_DATA_DESCRIPTOR, GP_ENCRYPTED, LOCAL_SIG,
    ZIP64_CENTRAL_END_SIG, ZIP64_CENTRAL_LOCATOR_SIG,
};

/// One file row in a [`DirectoryDisplayInfo`] tree.
#[derive(Debug, Clone, Default)]
pub struct FileDisplayInfo {
    pub fname: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

/// Recursive directory listing for UI callers, sorted in natural order.
#[derive(Debug, Clone, Default)]
pub struct DirectoryDisplayInfo {
    pub dirname: String,
    pub dirs: Vec<DirectoryDisplayInfo>,
    pub files: Vec<FileDisplayInfo>,
}

struct ZipIndex {
    entries: Vec<LocalHeader>,
    centrals: Vec<CentralHeader>,
    data_offsets: Vec<u64>,
}

// ── Record parsing ───────────────────────────────────────────────────────────

fn read_local_entry(r: &mut ByteReader<'_>) -> Result<LocalHeader> {
    let mut h = LocalHeader {
        needed_version: r.read16le()?,
        gp_bitflag: r.read16le()?,
        compression: r.read16le()?,
        last_mod_time: r.read16le()?,
        last_mod_date: r.read16le()?,
        crc32: r.read32le()?,
        ..Default::default()
    };
    let compressed32 = r.read32le()?;
    let uncompressed32 = r.read32le()?;
    let fname_len = r.read16le()? as usize;
    let extra_len = r.read16le()? as usize;
    h.fname = String::from_utf8_lossy(r.read_bytes(fname_len)?).into_owned();
    h.extra = r.read_bytes(extra_len)?.to_vec();
    h.compressed_size = u64::from(compressed32);
    h.uncompressed_size = u64::from(uncompressed32);
    if compressed32 == 0xFFFF_FFFF || uncompressed32 == 0xFFFF_FFFF {
        let (compressed, uncompressed) = find_zip64_sizes(&h.extra)?;
        h.compressed_size = compressed;
        h.uncompressed_size = uncompressed;
    }
    h.unix = find_unix_extra(&h.extra);
    Ok(h)
}

fn read_central_entry(r: &mut ByteReader<'_>) -> Result<CentralHeader> {
    let mut c = CentralHeader {
        version_made_by: r.read16le()?,
        version_needed: r.read16le()?,
        bit_flag: r.read16le()?,
        compression_method: r.read16le()?,
        last_mod_time: r.read16le()?,
        last_mod_date: r.read16le()?,
        crc32: r.read32le()?,
        compressed_size: r.read32le()?,
        uncompressed_size: r.read32le()?,
        ..Default::default()
    };
    let fname_len = r.read16le()? as usize;
    let extra_len = r.read16le()? as usize;
    let comment_len = r.read16le()? as usize;
    c.disk_number_start = r.read16le()?;
    c.internal_file_attributes = r.read16le()?;
    c.external_file_attributes = r.read32le()?;
    c.local_header_rel_offset = u64::from(r.read32le()?);
    c.fname = String::from_utf8_lossy(r.read_bytes(fname_len)?).into_owned();
    c.extra_field = r.read_bytes(extra_len)?.to_vec();
    c.comment = r.read_bytes(comment_len)?.to_vec();
    Ok(c)
}

fn read_zip64_end_record(r: &mut ByteReader<'_>) -> Result<Zip64EndRecord> {
    let mut er = Zip64EndRecord {
        recordsize: r.read64le()?,
        version_made_by: r.read16le()?,
        version_needed: r.read16le()?,
        disk_number: r.read32le()?,
        dir_start_disk_number: r.read32le()?,
        this_disk_num_entries: r.read64le()?,
        total_entries: r.read64le()?,
        dir_size: r.read64le()?,
        dir_offset: r.read64le()?,
        extensible: Vec::new(),
    };
    let fixed = 2 + 2 + 4 + 4 + 8 + 8 + 8 + 8;
    let ext_size = er
        .recordsize
        .checked_sub(fixed)
        .ok_or_else(|| ZipError::format("ZIP64 end record too small"))?;
    let ext_size = usize::try_from(ext_size)
        .map_err(|_| ZipError::format("ZIP64 end record extensible data too large"))?;
    er.extensible = r.read_bytes(ext_size)?.to_vec();
    Ok(er)
}

fn read_zip64_locator(r: &mut ByteReader<'_>) -> Result<Zip64Locator> {
    Ok(Zip64Locator {
        central_dir_disk_number: r.read32le()?,
        central_dir_offset: r.read64le()?,
        num_disks: r.read32le()?,
    })
}

fn read_end_record(r: &mut ByteReader<'_>) -> Result<EndRecord> {
    let mut el = EndRecord {
        disk_number: r.read16le()?,
        central_dir_disk_number: r.read16le()?,
        this_disk_num_entries: r.read16le()?,
        total_entries: r.read16le()?,
        dir_size: r.read32le()?,
        dir_offset_start_disk: r.read32le()?,
        comment: Vec::new(),
    };
    let comment_len = r.read16le()? as usize;
    el.comment = r.read_bytes(comment_len)?.to_vec();
    Ok(el)
}

// ── Directory tree construction ──────────────────────────────────────────────

fn subdir<'a>(node: &'a mut DirectoryDisplayInfo, name: &str) -> &'a mut DirectoryDisplayInfo {
    let idx = match node.dirs.iter().position(|d| d.dirname == name) {
        Some(idx) => idx,
        None => {
            node.dirs.push(DirectoryDisplayInfo {
                dirname: name.to_string(),
                ..Default::default()
            });
            node.dirs.len() - 1
        }
    };
    &mut node.dirs[idx]
}

fn sort_tree(node: &mut DirectoryDisplayInfo) {
    node.dirs
        .sort_by(|a, b| natural_compare(&a.dirname, &b.dirname));
    node.files
        .sort_by(|a, b| natural_compare(&a.fname, &b.fname));
    for d in &mut node.dirs {
        sort_tree(d);
    }
}

fn tree_from_headers(entries: &[LocalHeader]) -> DirectoryDisplayInfo {
    let mut root = DirectoryDisplayInfo::default();
    for lh in entries {
        // Names ending in '/' are explicit directory entries with no file
        // record of their own.
        let is_dir = lh.fname.ends_with('/');
        let parts: Vec<&str> = lh.fname.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            continue;
        }
        let (dir_parts, file_part) = if is_dir {
            (&parts[..], None)
        } else {
            (&parts[..parts.len() - 1], Some(parts[parts.len() - 1]))
        };
        let mut node = &mut root;
        for &part in dir_parts {
            node = subdir(node, part);
        }
        if let Some(fname) = file_part {
            node.files.push(FileDisplayInfo {
                fname: fname.to_string(),
                compressed_size: lh.compressed_size,
                uncompressed_size: lh.uncompressed_size,
            });
        }
    }
    sort_tree(&mut root);
    root
}

// ── The reader ───────────────────────────────────────────────────────────────

/// A parsed archive, ready for parallel extraction.
///
/// Dropping the value joins a still-running unpack; use
/// [`wait`](Self::wait) to block for it explicitly.
pub struct ZipFile {
    fname: PathBuf,
    index: Arc<ZipIndex>,
    z64end: Option<Zip64EndRecord>,
    z64loc: Option<Zip64Locator>,
    end: EndRecord,
    tc: Arc<TaskControl>,
    thread: Option<JoinHandle<()>>,
}

impl ZipFile {
    /// Open and fully index an archive. Any structural violation is fatal.
    pub fn open(fname: impl Into<PathBuf>) -> Result<ZipFile> {
        let fname = fname.into();
        let file = File::open(&fname)
            .map_err(|e| ZipError::io(format!("could not open archive {}", fname.display()), e))?;
        let map = map_file(&file)?;
        let mut r = ByteReader::new(&map);

        let mut entries = Vec::new();
        let mut data_offsets = Vec::new();
        loop {
            let record_start = r.tell();
            if r.remaining() < 4 {
                break;
            }
            if r.read32le()? != LOCAL_SIG {
                r.seek(record_start);
                break;
            }
            let lh = read_local_entry(&mut r)?;
            if lh.gp_bitflag & GP_ENCRYPTED != 0 {
                return Err(ZipError::Unsupported(
                    "this archive is encrypted; encrypted ZIP archives are not supported"
                        .to_string(),
                ));
            }
            if lh.fname.is_empty() {
                return Err(ZipError::format("entry with an empty name"));
            }
            if is_absolute_path(&lh.fname) {
                return Err(ZipError::format(format!(
                    "entry name is an absolute path: {}",
                    lh.fname
                )));
            }
            data_offsets.push(r.tell() as u64);
            let data_len = usize::try_from(lh.compressed_size)
                .map_err(|_| ZipError::format("entry larger than the address space"))?;
            r.skip(data_len)?;
            if lh.gp_bitflag & GP_DATA_DESCRIPTOR != 0 {
                // Trailing data descriptor: crc32 + compressed + uncompressed.
                r.skip(3 * 4)?;
            }
            entries.push(lh);
        }

        let mut centrals = Vec::new();
        loop {
            let record_start = r.tell();
            if r.remaining() < 4 {
                break;
            }
            if r.read32le()? != CENTRAL_SIG {
                r.seek(record_start);
                break;
            }
            centrals.push(read_central_entry(&mut r)?);
        }

        if entries.len() != centrals.len() {
            return Err(ZipError::format(format!(
                "mismatch: file has {} local entries but {} central entries",
                entries.len(),
                centrals.len()
            )));
        }

        let mut sig = r.read32le()?;
        let mut z64end = None;
        let mut z64loc = None;
        if sig == ZIP64_CENTRAL_END_SIG {
            let er = read_zip64_end_record(&mut r)?;
            if er.total_entries != entries.len() as u64 {
                return Err(ZipError::format(
                    "zip64 directory has an incorrect number of entries",
                ));
            }
            z64end = Some(er);
            sig = r.read32le()?;
            if sig == ZIP64_CENTRAL_LOCATOR_SIG {
                z64loc = Some(read_zip64_locator(&mut r)?);
                sig = r.read32le()?;
            }
        }
        if sig != CENTRAL_END_SIG {
            return Err(ZipError::format("missing end-of-central-directory record"));
        }
        let end = read_end_record(&mut r)?;
        if end.total_entries != 0xFFFF && u64::from(end.total_entries) != entries.len() as u64 {
            return Err(ZipError::format(
                "end record has an incorrect directory size",
            ));
        }

        Ok(ZipFile {
            fname,
            index: Arc::new(ZipIndex {
                entries,
                centrals,
                data_offsets,
            }),
            z64end,
            z64loc,
            end,
            tc: Arc::new(TaskControl::new()),
            thread: None,
        })
    }

    /// Number of entries in the archive.
    pub fn size(&self) -> usize {
        self.index.entries.len()
    }

    pub fn localheaders(&self) -> &[LocalHeader] {
        &self.index.entries
    }

    pub fn centralheaders(&self) -> &[CentralHeader] {
        &self.index.centrals
    }

    pub fn zip64_end_record(&self) -> Option<&Zip64EndRecord> {
        self.z64end.as_ref()
    }

    pub fn zip64_locator(&self) -> Option<&Zip64Locator> {
        self.z64loc.as_ref()
    }

    pub fn end_record(&self) -> &EndRecord {
        &self.end
    }

    /// Recursive listing of the archive contents, levels sorted in natural
    /// order.
    pub fn build_tree(&self) -> DirectoryDisplayInfo {
        tree_from_headers(&self.index.entries)
    }

    /// Extract every entry under `prefix` with up to `num_threads` parallel
    /// workers (`0` = one per logical core). Returns immediately with the
    /// progress handle; each worker writes its own target, so completion
    /// order is scheduling-dependent while the result log order reflects
    /// it.
    ///
    /// A `ZipFile` runs one extraction; a second call is a misuse error.
    pub fn unzip(&mut self, prefix: &str, num_threads: usize) -> Result<Arc<TaskControl>> {
        if self.tc.state() != TaskState::NotStarted {
            return Err(ZipError::Misuse(
                "tried to start an already used unpacking process".to_string(),
            ));
        }
        let num_threads = if num_threads == 0 {
            count_cores()
        } else {
            num_threads
        };
        self.tc.reserve(self.index.entries.len())?;
        self.tc.set_state(TaskState::Running)?;

        let tc = Arc::clone(&self.tc);
        let index = Arc::clone(&self.index);
        let fname = self.fname.clone();
        let prefix = prefix.to_string();
        self.thread = Some(thread::spawn(move || {
            if let Err(e) = run_unzip(&fname, index, &prefix, num_threads, &tc) {
                eprintln!("Unpacking failed: {e}");
            }
            let _ = tc.set_state(TaskState::Finished);
        }));
        Ok(Arc::clone(&self.tc))
    }

    /// Join the unpack orchestrator. Idempotent.
    pub fn wait(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ZipFile {
    fn drop(&mut self) {
        self.wait();
    }
}

fn record_result(tc: &TaskControl, res: UnpackResult) {
    if res.ok {
        tc.add_success(res.message);
    } else {
        tc.add_failure(res.message);
    }
}

fn run_unzip(
    fname: &Path,
    index: Arc<ZipIndex>,
    prefix: &str,
    num_threads: usize,
    tc: &Arc<TaskControl>,
) -> Result<()> {
    // Workers get their own map of the archive, shared read-only. The
    // orchestrator owns it and joins every worker before releasing it.
    let file = File::open(fname)
        .map_err(|e| ZipError::io(format!("could not open archive {}", fname.display()), e))?;
    let map = Arc::new(map_file(&file)?);

    let pool = WorkerPool::new(num_threads)?;
    let (tx, rx) = crossbeam_channel::unbounded::<UnpackResult>();
    let mut submitted = 0usize;
    let mut drained = 0usize;

    for i in 0..index.entries.len() {
        while submitted - drained >= num_threads {
            match rx.recv() {
                Ok(res) => {
                    record_result(tc, res);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        if tc.should_stop() {
            break;
        }

        let map = Arc::clone(&map);
        let index = Arc::clone(&index);
        let worker_tc = Arc::clone(tc);
        let tx = tx.clone();
        let prefix = prefix.to_string();
        pool.submit(move || {
            let lh = &index.entries[i];
            let ch = &index.centrals[i];
            let start = index.data_offsets[i] as usize;
            let res = match start
                .checked_add(lh.compressed_size as usize)
                .and_then(|end| map.get(start..end))
            {
                Some(data) => unpack_entry(&prefix, lh, ch, data, &worker_tc),
                None => UnpackResult {
                    ok: false,
                    message: format!("FAIL: {}\narchive shrank while unpacking", lh.fname),
                },
            };
            let _ = tx.send(res);
        });
        submitted += 1;
    }

    drop(tx);
    pool.join();
    while let Ok(res) = rx.recv() {
        record_result(tc, res);
    }
    Ok(())
}
