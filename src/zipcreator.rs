//! Parallel archive writer.
//!
//! [`ZipCreator::create`] launches one orchestrator thread and returns a
//! [`TaskControl`] handle immediately. The orchestrator keeps up to
//! `num_threads` compression workers alive, each coupled to its own
//! [`ByteQueue`], and is the only thread that touches the output file.
//!
//! Entries land in the archive in submission order. A task becomes eligible
//! for writing when its queue is `Full` (the producer is blocked waiting for
//! the writer) or `Shutdown` (the producer is done); the orchestrator scans
//! for either, preferring `Full`, and sleeps 50 ms when nothing is ready.
//! When a very large entry occupies the writer, later tasks simply finish or
//! fill their buffers and wait their turn.
//!
//! Each entry is written as: local header with size sentinels → streamed
//! data → header rewritten in place with the now-known compressed size.
//! After the last entry come the central directory, the ZIP64 end record,
//! the ZIP64 locator and the end-of-central-directory record.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bytequeue::{ByteQueue, QueueState};
use crate::compress::{compress_entry, CompressResult};
use crate::error::{Result, ZipError};
use crate::file::OutputFile;
use crate::fileutils::count_cores;
use crate::taskcontrol::{TaskControl, TaskState};
use crate::zipdefs::{
    pack_unix_extra, pack_zip64, CentralHeader, EndRecord, FileInfo, FileType, LocalHeader,
    Zip64EndRecord, Zip64Locator, CENTRAL_END_SIG, CENTRAL_SIG, GP_BITFLAG, LOCAL_SIG,
    MADE_BY_UNIX, NEEDED_VERSION, ZIP64_CENTRAL_END_SIG, ZIP64_CENTRAL_LOCATOR_SIG,
    ZIP_NO_COMPRESSION,
};

/// Per-task buffer: large enough that most entries never block their worker,
/// small enough to not exhaust a 32-bit address space.
const QUEUE_SIZE: usize = if cfg!(target_pointer_width = "64") {
    1024 * 1024 * 1024
} else {
    20 * 1024 * 1024
};

/// Orchestrator nap between readiness scans.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One in-flight pack job: the entry, its byte queue and the worker thread
/// whose return value finishes the entry's headers.
struct CompressionTask {
    fi: FileInfo,
    queue: Arc<ByteQueue>,
    handle: Option<JoinHandle<Result<CompressResult>>>,
}

impl CompressionTask {
    /// Join the worker and surface its result. A panicking worker turns
    /// into an error on the entry rather than poisoning the whole run.
    fn take_result(&mut self) -> Result<CompressResult> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(res) => res,
                Err(_) => Err(ZipError::io(
                    format!("compression worker for {} panicked", self.fi.name),
                    std::io::Error::from(std::io::ErrorKind::Other),
                )),
            },
            None => Err(ZipError::Misuse(
                "compression result taken twice".to_string(),
            )),
        }
    }
}

fn launch_task(
    tasks: &mut Vec<CompressionTask>,
    fi: FileInfo,
    use_lzma: bool,
    tc: &Arc<TaskControl>,
) {
    let queue = Arc::new(ByteQueue::new(QUEUE_SIZE));
    let worker_queue = Arc::clone(&queue);
    let worker_tc = Arc::clone(tc);
    let worker_fi = fi.clone();
    let handle = thread::spawn(move || {
        // The queue must be shut down on every exit path, panic included;
        // a queue that never reaches Shutdown would stall the writer.
        struct ShutdownGuard(Arc<ByteQueue>);
        impl Drop for ShutdownGuard {
            fn drop(&mut self) {
                self.0.shutdown();
            }
        }
        let _guard = ShutdownGuard(Arc::clone(&worker_queue));
        compress_entry(&worker_fi, &worker_queue, use_lzma, &worker_tc)
    });
    tasks.push(CompressionTask {
        fi,
        queue,
        handle: Some(handle),
    });
}

// ── Record serialization ─────────────────────────────────────────────────────

fn write_local_header(ofile: &mut OutputFile, lh: &LocalHeader) -> Result<()> {
    ofile.write32le(LOCAL_SIG)?;
    ofile.write16le(lh.needed_version)?;
    ofile.write16le(lh.gp_bitflag)?;
    ofile.write16le(lh.compression)?;
    ofile.write16le(lh.last_mod_time)?;
    ofile.write16le(lh.last_mod_date)?;
    ofile.write32le(lh.crc32)?;
    ofile.write32le(lh.compressed_size as u32)?;
    ofile.write32le(lh.uncompressed_size as u32)?;
    ofile.write16le(lh.fname.len() as u16)?;
    ofile.write16le(lh.extra.len() as u16)?;
    ofile.write_all(lh.fname.as_bytes())?;
    ofile.write_all(&lh.extra)
}

fn write_central_header(ofile: &mut OutputFile, ch: &CentralHeader) -> Result<()> {
    ofile.write32le(CENTRAL_SIG)?;
    ofile.write16le(ch.version_made_by)?;
    ofile.write16le(ch.version_needed)?;
    ofile.write16le(ch.bit_flag)?;
    ofile.write16le(ch.compression_method)?;
    ofile.write16le(ch.last_mod_time)?;
    ofile.write16le(ch.last_mod_date)?;
    ofile.write32le(ch.crc32)?;
    ofile.write32le(ch.compressed_size)?;
    ofile.write32le(ch.uncompressed_size)?;
    ofile.write16le(ch.fname.len() as u16)?;
    ofile.write16le(ch.extra_field.len() as u16)?;
    ofile.write16le(ch.comment.len() as u16)?;
    ofile.write16le(ch.disk_number_start)?;
    ofile.write16le(ch.internal_file_attributes)?;
    ofile.write32le(ch.external_file_attributes)?;
    ofile.write32le(ch.local_header_rel_offset as u32)?;
    ofile.write_all(ch.fname.as_bytes())?;
    ofile.write_all(&ch.extra_field)?;
    ofile.write_all(&ch.comment)
}

fn write_zip64_end_record(ofile: &mut OutputFile, r: &Zip64EndRecord) -> Result<()> {
    ofile.write32le(ZIP64_CENTRAL_END_SIG)?;
    ofile.write64le(r.recordsize)?;
    ofile.write16le(r.version_made_by)?;
    ofile.write16le(r.version_needed)?;
    ofile.write32le(r.disk_number)?;
    ofile.write32le(r.dir_start_disk_number)?;
    ofile.write64le(r.this_disk_num_entries)?;
    ofile.write64le(r.total_entries)?;
    ofile.write64le(r.dir_size)?;
    ofile.write64le(r.dir_offset)?;
    ofile.write_all(&r.extensible)
}

fn write_zip64_locator(ofile: &mut OutputFile, l: &Zip64Locator) -> Result<()> {
    ofile.write32le(ZIP64_CENTRAL_LOCATOR_SIG)?;
    ofile.write32le(l.central_dir_disk_number)?;
    ofile.write64le(l.central_dir_offset)?;
    ofile.write32le(l.num_disks)
}

fn write_end_record(ofile: &mut OutputFile, ed: &EndRecord) -> Result<()> {
    ofile.write32le(CENTRAL_END_SIG)?;
    ofile.write16le(ed.disk_number)?;
    ofile.write16le(ed.central_dir_disk_number)?;
    ofile.write16le(ed.this_disk_num_entries)?;
    ofile.write16le(ed.total_entries)?;
    ofile.write32le(ed.dir_size)?;
    ofile.write32le(ed.dir_offset_start_disk)?;
    ofile.write16le(ed.comment.len() as u16)?;
    ofile.write_all(&ed.comment)
}

// ── Entry writing ────────────────────────────────────────────────────────────

/// Stream the task's queue into the archive until the producer shuts it
/// down, then flush whatever the shutdown raced in.
fn drain_queue(q: &ByteQueue, ofile: &mut OutputFile) -> Result<()> {
    loop {
        q.wait_until_full_or_shutdown();
        let buf = q.pop();
        ofile.write_all(&buf)?;
        if q.state() == QueueState::Shutdown {
            let last = q.pop();
            ofile.write_all(&last)?;
            return Ok(());
        }
    }
}

/// Throw away everything a failed task still has buffered so its worker can
/// finish and the queue can be destroyed empty.
fn drain_and_discard(q: &ByteQueue) {
    loop {
        q.wait_until_full_or_shutdown();
        q.pop();
        if q.state() == QueueState::Shutdown {
            q.pop();
            return;
        }
    }
}

fn write_entry(ofile: &mut OutputFile, t: &mut CompressionTask) -> Result<CentralHeader> {
    let local_header_offset = ofile.tell()?;
    let uncompressed_size = t.fi.size;

    // A finished worker contributes to the first header write: the trailing
    // slash on directory names and the symlink/device bytes prepended to
    // the Unix extra both change the header length, so they must be in
    // place before any bytes hit the file. Still-streaming workers (queue
    // Full) are plain files whose crc/method placeholders the mandatory
    // rewrite fixes.
    let early_result = if t.queue.state() == QueueState::Shutdown {
        Some(t.take_result()?)
    } else {
        None
    };

    let mut ue = t.fi.unix.clone();
    let mut fname = t.fi.name.clone();
    let mut crc32 = 0u32;
    let mut compression = ZIP_NO_COMPRESSION;
    if let Some(res) = &early_result {
        if !res.extra_unix_bytes.is_empty() {
            let mut data = res.extra_unix_bytes.clone();
            data.extend_from_slice(&ue.data);
            ue.data = data;
        }
        if res.entry_type == FileType::Directory && !fname.ends_with('/') {
            fname.push('/');
        }
        crc32 = res.crc32;
        compression = res.compression;
    }

    let mut lh = LocalHeader {
        needed_version: NEEDED_VERSION,
        gp_bitflag: GP_BITFLAG,
        compression,
        last_mod_time: 0,
        last_mod_date: 0,
        crc32,
        compressed_size: 0xFFFF_FFFF,
        uncompressed_size: 0xFFFF_FFFF,
        fname,
        extra: Vec::new(),
        unix: ue.clone(),
    };
    // Fake compressed size for now; the real one is known only once all
    // data has been read out of the queue.
    lh.extra = pack_zip64(uncompressed_size, 0xFFFF_FFFF, local_header_offset);
    lh.extra.extend_from_slice(&pack_unix_extra(&ue));
    write_local_header(ofile, &lh)?;

    let data_start = ofile.tell()?;
    drain_queue(&t.queue, ofile)?;
    let data_end = ofile.tell()?;

    let result = match early_result {
        Some(res) => res,
        None => t.take_result()?,
    };
    lh.crc32 = result.crc32;
    lh.compression = result.compression;

    // Fix the header by rewriting it in place.
    lh.extra = pack_zip64(uncompressed_size, data_end - data_start, local_header_offset);
    lh.extra.extend_from_slice(&pack_unix_extra(&ue));
    ofile.seek(local_header_offset)?;
    write_local_header(ofile, &lh)?;
    ofile.seek(data_end)?;

    Ok(CentralHeader {
        version_made_by: (MADE_BY_UNIX << 8) | NEEDED_VERSION,
        version_needed: lh.needed_version,
        bit_flag: lh.gp_bitflag,
        compression_method: lh.compression,
        last_mod_time: lh.last_mod_time,
        last_mod_date: lh.last_mod_date,
        crc32: lh.crc32,
        compressed_size: 0xFFFF_FFFF,
        uncompressed_size: 0xFFFF_FFFF,
        disk_number_start: 0,
        internal_file_attributes: 0,
        external_file_attributes: t.fi.mode << 16,
        local_header_rel_offset: local_header_offset,
        fname: lh.fname.clone(),
        extra_field: lh.extra.clone(),
        comment: Vec::new(),
    })
}

fn handle_future(
    ofile: &mut OutputFile,
    mut t: CompressionTask,
    chs: &mut Vec<CentralHeader>,
    tc: &TaskControl,
) {
    let entry_offset = ofile.tell();
    match write_entry(ofile, &mut t) {
        Ok(ch) => {
            chs.push(ch);
            tc.add_success(format!("OK: {}", t.fi.name));
        }
        Err(e) => {
            // Free a possibly blocked worker, join it, then cut the entry's
            // partial bytes so the archive ends at the last good entry.
            drain_and_discard(&t.queue);
            if t.handle.is_some() {
                let _ = t.take_result();
            }
            if let Ok(offset) = entry_offset {
                let _ = ofile.truncate(offset);
            }
            tc.add_failure(format!("FAIL: {}\n{e}", t.fi.name));
        }
    }
}

/// Pick the next task to write: any queue that is `Full` (its producer is
/// blocked on us) beats any that is `Shutdown`; when nothing is ready,
/// sleep and rescan.
fn pop_future(
    ofile: &mut OutputFile,
    tasks: &mut Vec<CompressionTask>,
    chs: &mut Vec<CentralHeader>,
    tc: &TaskControl,
) {
    loop {
        for state in [QueueState::Full, QueueState::Shutdown] {
            if let Some(idx) = tasks.iter().position(|t| t.queue.state() == state) {
                let t = tasks.remove(idx);
                handle_future(ofile, t, chs, tc);
                return;
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn run(
    fname: &Path,
    files: Vec<FileInfo>,
    num_threads: usize,
    use_lzma: bool,
    tc: &Arc<TaskControl>,
) -> Result<()> {
    let mut ofile = OutputFile::create(fname)?;
    let mut chs: Vec<CentralHeader> = Vec::new();
    let mut tasks: Vec<CompressionTask> = Vec::with_capacity(num_threads);

    // Keep as many compression jobs running as the caller allowed. A huge
    // entry may monopolise the writer for a while; later tasks then finish
    // or fill their buffers and wait, which is fine because only Full and
    // Shutdown queues are ever selected.
    for fi in files {
        if tc.should_stop() {
            break;
        }
        while tasks.len() >= num_threads {
            pop_future(&mut ofile, &mut tasks, &mut chs, tc);
        }
        launch_task(&mut tasks, fi, use_lzma, tc);
    }
    while !tasks.is_empty() {
        pop_future(&mut ofile, &mut tasks, &mut chs, tc);
    }

    if chs.is_empty() {
        return Err(ZipError::format("all files failed to compress"));
    }
    if !tc.should_stop() {
        let ch_offset = ofile.tell()?;
        for ch in &chs {
            write_central_header(&mut ofile, ch)?;
        }
        let ch_end_offset = ofile.tell()?;

        let z64r = Zip64EndRecord {
            recordsize: 2 + 2 + 4 + 4 + 8 + 8 + 8 + 8,
            version_made_by: chs[0].version_made_by,
            version_needed: NEEDED_VERSION,
            disk_number: 0,
            dir_start_disk_number: 0,
            this_disk_num_entries: chs.len() as u64,
            total_entries: chs.len() as u64,
            dir_size: ch_end_offset - ch_offset,
            dir_offset: ch_offset,
            extensible: Vec::new(),
        };
        write_zip64_end_record(&mut ofile, &z64r)?;

        let z64l = Zip64Locator {
            central_dir_disk_number: 0,
            central_dir_offset: ch_end_offset,
            num_disks: 1,
        };
        write_zip64_locator(&mut ofile, &z64l)?;

        let ed = EndRecord {
            disk_number: 0,
            central_dir_disk_number: 0,
            this_disk_num_entries: 0xFFFF,
            total_entries: 0xFFFF,
            dir_size: 0xFFFF_FFFF,
            dir_offset_start_disk: 0xFFFF_FFFF,
            comment: Vec::new(),
        };
        write_end_record(&mut ofile, &ed)?;
    }
    Ok(())
}

/// Parallel ZIP64 archive creator.
///
/// The orchestrator thread is joined when the creator is dropped (or
/// earlier via [`wait`](Self::wait)), so the [`TaskControl`] handle has
/// reached `Finished` by then.
pub struct ZipCreator {
    fname: PathBuf,
    use_lzma: bool,
    tc: Arc<TaskControl>,
    thread: Option<JoinHandle<()>>,
}

impl ZipCreator {
    pub fn new(fname: impl Into<PathBuf>) -> Self {
        ZipCreator {
            fname: fname.into(),
            // LZMA needs liblzma at its best; on other targets the deflate
            // path is the safe default.
            use_lzma: cfg!(unix),
            tc: Arc::new(TaskControl::new()),
            thread: None,
        }
    }

    /// Choose between LZMA1 and DEFLATE for large regular files.
    pub fn use_lzma(&mut self, enable: bool) -> &mut Self {
        self.use_lzma = enable;
        self
    }

    /// Pack `files` into the archive with up to `num_threads` concurrent
    /// compressors (`0` = one per logical core). Returns immediately; watch
    /// the returned handle for progress, call [`wait`](Self::wait) or drop
    /// the creator for completion.
    ///
    /// A creator packs exactly one archive; a second call is a misuse
    /// error.
    pub fn create(&mut self, files: Vec<FileInfo>, num_threads: usize) -> Result<Arc<TaskControl>> {
        if self.tc.state() != TaskState::NotStarted {
            return Err(ZipError::Misuse(
                "tried to start an already used packing process".to_string(),
            ));
        }
        let num_threads = if num_threads == 0 {
            count_cores()
        } else {
            num_threads
        };
        self.tc.reserve(files.len())?;
        self.tc.set_state(TaskState::Running)?;

        let tc = Arc::clone(&self.tc);
        let fname = self.fname.clone();
        let use_lzma = self.use_lzma;
        self.thread = Some(thread::spawn(move || {
            if let Err(e) = run(&fname, files, num_threads, use_lzma, &tc) {
                eprintln!("Fail: {e}");
            }
            let _ = tc.set_state(TaskState::Finished);
        }));
        Ok(Arc::clone(&self.tc))
    }

    /// Join the orchestrator thread. Idempotent.
    pub fn wait(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ZipCreator {
    fn drop(&mut self) {
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskcontrol::TaskState;
    use tempfile::TempDir;

    #[test]
    fn create_twice_is_misuse() {
        let dir = TempDir::new().unwrap();
        let mut creator = ZipCreator::new(dir.path().join("a.zip"));
        creator.create(Vec::new(), 1).unwrap();
        creator.wait();
        assert!(matches!(
            creator.create(Vec::new(), 1),
            Err(ZipError::Misuse(_))
        ));
    }

    #[test]
    fn empty_input_finishes_without_archive_trailer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.zip");
        let mut creator = ZipCreator::new(&path);
        let tc = creator.create(Vec::new(), 2).unwrap();
        creator.wait();
        assert_eq!(tc.state(), TaskState::Finished);
        assert_eq!(tc.total(), 0);
        // Nothing could be packed, so no central directory was written.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn missing_input_is_a_logged_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.zip");
        let mut creator = ZipCreator::new(&path);
        let fi = FileInfo {
            name: dir
                .path()
                .join("does-not-exist")
                .to_str()
                .unwrap()
                .to_string(),
            unix: Default::default(),
            mode: 0o100644,
            size: 10,
            device_id: 0,
        };
        let tc = creator.create(vec![fi], 1).unwrap();
        creator.wait();
        assert_eq!(tc.state(), TaskState::Finished);
        assert_eq!(tc.failures(), 1);
        assert_eq!(tc.successes(), 0);
        assert!(tc.entry(0).unwrap().starts_with("FAIL:"));
    }
}
