//! Cancellation: a stopped run must wind down in bounded time, keep its
//! bookkeeping consistent and leave no half-written trailer behind.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

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

fn xorshift_bytes(seed: u64, n: usize) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(n + 8);
    while out.len() < n {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(n);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Stop a 100-entry pack run shortly after it starts. The run must finish,
/// account for at most 100 entries, and skip the central directory when the
/// stop actually cut it short.
#[test]
fn stopping_a_pack_run_truncates_the_archive() {
    const NUM_FILES: usize = 100;
    let dir = TempDir::new().unwrap();
    for i in 0..NUM_FILES {
        std::fs::write(
            dir.path().join(format!("blob{i:03}.bin")),
            xorshift_bytes(i as u64 + 1, 1024 * 1024),
        )
        .unwrap();
    }

    let (state, successes, failures) = in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("big.zip");
        creator.use_lzma(false);
        let files = (0..NUM_FILES)
            .map(|i| FileInfo::from_path(format!("blob{i:03}.bin")).unwrap())
            .collect();
        let tc = creator.create(files, 4).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        tc.stop();

        // Winding down means finishing in-flight entries, not the rest of
        // the queue; give it generous but bounded time.
        let deadline = Instant::now() + Duration::from_secs(120);
        while tc.state() != TaskState::Finished {
            assert!(Instant::now() < deadline, "cancelled run did not finish");
            std::thread::sleep(Duration::from_millis(10));
        }
        creator.wait();
        (tc.state(), tc.successes(), tc.failures())
    });

    assert_eq!(state, TaskState::Finished);
    assert!(successes + failures <= NUM_FILES);

    // If the stop interrupted the run, no trailer may follow the entries.
    let raw = std::fs::read(dir.path().join("big.zip")).unwrap();
    if successes < NUM_FILES {
        assert!(
            find_subslice(&raw, b"PK\x05\x06").is_none(),
            "truncated archive must not carry an end-of-central-directory record"
        );
        assert!(find_subslice(&raw, b"PK\x06\x06").is_none());
    }
}

/// Workers see the stop flag between codec chunks: a run stopped before it
/// starts fails fast and still reaches Finished.
#[test]
fn stop_before_work_prevents_all_entries() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("one.bin"), xorshift_bytes(7, 64 * 1024)).unwrap();

    let (state, successes) = in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("stopped.zip");
        creator.use_lzma(false);
        let files = vec![FileInfo::from_path("one.bin").unwrap()];
        // Ask for the stop before the orchestrator has a chance to launch
        // anything.
        let tc = creator.create(files, 1).unwrap();
        tc.stop();
        creator.wait();
        (tc.state(), tc.successes())
    });
    assert_eq!(state, TaskState::Finished);
    // Zero or one entries may have slipped through depending on timing,
    // never more.
    assert!(successes <= 1);
}

/// Cancelling an unpack stops scheduling new entries and still drains the
/// in-flight ones into the log.
#[test]
fn stopping_an_unpack_run_is_bounded() {
    const NUM_FILES: usize = 50;
    let dir = TempDir::new().unwrap();
    for i in 0..NUM_FILES {
        std::fs::write(
            dir.path().join(format!("f{i:02}.bin")),
            xorshift_bytes(i as u64 + 99, 128 * 1024),
        )
        .unwrap();
    }
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("many.zip");
        creator.use_lzma(false);
        let files = (0..NUM_FILES)
            .map(|i| FileInfo::from_path(format!("f{i:02}.bin")).unwrap())
            .collect();
        let tc = creator.create(files, 4).unwrap();
        creator.wait();
        assert_eq!(tc.successes(), NUM_FILES);
    });

    let out = TempDir::new().unwrap();
    let mut archive = ZipFile::open(dir.path().join("many.zip")).unwrap();
    let tc = archive.unzip(out.path().to_str().unwrap(), 2).unwrap();
    tc.stop();
    archive.wait();

    assert_eq!(tc.state(), TaskState::Finished);
    assert!(tc.finished() <= NUM_FILES);
    assert_eq!(tc.successes() + tc.failures(), tc.finished());
}
