//! End-to-end pack/unpack round trips.
//!
//! Covers the single-file STORE layout, codec selection for small vs large
//! entries, submission-order preservation, size sentinels with ZIP64
//! extras, CRC bookkeeping and single-thread determinism.

use std::path::Path;
use std::sync::Mutex;

use parzip::compress::crc32_blocks;
use parzip::zipdefs::{ZIP_DEFLATE, ZIP_LZMA, ZIP_NO_COMPRESSION};
use parzip::{FileInfo, TaskState, ZipCreator, ZipFile};
use tempfile::TempDir;

// Entry names double as source paths, so packing runs relative to the
// working directory; serialise the tests that move it.
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
    // Pin the recorded times so archives are reproducible across runs.
    fi.unix.atime = 1_600_000_000;
    fi.unix.mtime = 1_600_000_000;
    fi
}

fn xorshift_bytes(n: usize) -> Vec<u8> {
    let mut state = 0x2545_F491_4F6C_DD1Du64;
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

/// One file, below the LZMA threshold: stored verbatim with the full ZIP64
/// plumbing around it.
#[test]
fn single_small_file_layout() {
    let dir = TempDir::new().unwrap();
    let content = b"Hello, world!\n";
    std::fs::write(dir.path().join("hello.txt"), content).unwrap();

    let archive_path = dir.path().join("out.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("out.zip");
        let tc = creator.create(vec![stat_entry("hello.txt")], 1).unwrap();
        creator.wait();
        assert_eq!(tc.state(), TaskState::Finished);
        assert_eq!(tc.successes(), 1);
        assert_eq!(tc.failures(), 0);
        assert_eq!(tc.entry(0).unwrap(), "OK: hello.txt");
    });

    let raw = std::fs::read(&archive_path).unwrap();
    // Local header basics.
    assert_eq!(&raw[0..4], b"PK\x03\x04");
    let method = u16::from_le_bytes([raw[8], raw[9]]);
    assert_eq!(method, ZIP_NO_COMPRESSION);
    let crc = u32::from_le_bytes([raw[14], raw[15], raw[16], raw[17]]);
    assert_eq!(crc, crc32_blocks(content));
    // 32-bit sizes are always sentinels.
    assert_eq!(&raw[18..22], &[0xFF; 4]);
    assert_eq!(&raw[22..26], &[0xFF; 4]);
    let name_len = u16::from_le_bytes([raw[26], raw[27]]) as usize;
    let extra_len = u16::from_le_bytes([raw[28], raw[29]]) as usize;
    assert_eq!(name_len, 9);
    assert_eq!(&raw[30..39], b"hello.txt");

    // ZIP64 extended info leads the extra field: tag 1, 28 payload bytes,
    // uncompressed and compressed sizes, header offset 0.
    let extra = &raw[30 + name_len..30 + name_len + extra_len];
    assert_eq!(u16::from_le_bytes([extra[0], extra[1]]), 0x0001);
    assert_eq!(u16::from_le_bytes([extra[2], extra[3]]), 28);
    let usize_ = u64::from_le_bytes(extra[4..12].try_into().unwrap());
    let csize = u64::from_le_bytes(extra[12..20].try_into().unwrap());
    let offset = u64::from_le_bytes(extra[20..28].try_into().unwrap());
    assert_eq!(usize_, 14);
    assert_eq!(csize, 14);
    assert_eq!(offset, 0);

    // Stored data follows the header immediately.
    let data_start = 30 + name_len + extra_len;
    assert_eq!(&raw[data_start..data_start + content.len()], content);

    // Trailer records, in order.
    let central = find_subslice(&raw, b"PK\x01\x02").unwrap();
    let z64_end = find_subslice(&raw, b"PK\x06\x06").unwrap();
    let z64_loc = find_subslice(&raw, b"PK\x06\x07").unwrap();
    let eocd = find_subslice(&raw, b"PK\x05\x06").unwrap();
    assert!(data_start + content.len() <= central);
    assert!(central < z64_end && z64_end < z64_loc && z64_loc < eocd);

    // The parser agrees.
    let archive = ZipFile::open(&archive_path).unwrap();
    assert_eq!(archive.size(), 1);
    let lh = &archive.localheaders()[0];
    assert_eq!(lh.fname, "hello.txt");
    assert_eq!(lh.compressed_size, 14);
    assert_eq!(lh.uncompressed_size, 14);
    assert_eq!(archive.zip64_end_record().unwrap().total_entries, 1);
    assert_eq!(archive.zip64_locator().unwrap().num_disks, 1);
    assert_eq!(archive.end_record().total_entries, 0xFFFF);
}

/// Small file stores, large incompressible file deflates without LZMA and
/// falls back to STORE with it. Central directory preserves submission
/// order either way.
#[test]
fn method_selection_and_order() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("small.txt"), b"aaaaaaaaaa").unwrap();
    let noise = xorshift_bytes(1024 * 1024);
    std::fs::write(dir.path().join("big.bin"), &noise).unwrap();

    // DEFLATE path.
    let deflate_zip = dir.path().join("deflate.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("deflate.zip");
        creator.use_lzma(false);
        let tc = creator
            .create(vec![stat_entry("small.txt"), stat_entry("big.bin")], 2)
            .unwrap();
        creator.wait();
        assert_eq!(tc.successes(), 2, "log: {:?} {:?}", tc.entry(0), tc.entry(1));
    });
    let archive = ZipFile::open(&deflate_zip).unwrap();
    assert_eq!(archive.localheaders()[0].fname, "small.txt");
    assert_eq!(archive.localheaders()[1].fname, "big.bin");
    assert_eq!(archive.localheaders()[0].compression, ZIP_NO_COMPRESSION);
    assert_eq!(archive.localheaders()[1].compression, ZIP_DEFLATE);
    assert_eq!(archive.centralheaders()[0].fname, "small.txt");
    assert_eq!(archive.centralheaders()[1].fname, "big.bin");

    // LZMA path: the compressibility probe rejects the noise, so it stores.
    let lzma_zip = dir.path().join("lzma.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("lzma.zip");
        creator.use_lzma(true);
        let tc = creator
            .create(vec![stat_entry("small.txt"), stat_entry("big.bin")], 2)
            .unwrap();
        creator.wait();
        assert_eq!(tc.successes(), 2);
    });
    let archive = ZipFile::open(&lzma_zip).unwrap();
    assert_eq!(archive.localheaders()[1].compression, ZIP_NO_COMPRESSION);
    assert_eq!(archive.localheaders()[1].compressed_size, noise.len() as u64);
}

/// A compressible large file actually takes the LZMA path end to end.
#[test]
fn lzma_round_trip() {
    let dir = TempDir::new().unwrap();
    let text: Vec<u8> = b"The quick brown fox jumps over the lazy dog. "
        .iter()
        .cycle()
        .take(300 * 1024)
        .copied()
        .collect();
    std::fs::write(dir.path().join("fox.txt"), &text).unwrap();

    let zip = dir.path().join("fox.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("fox.zip");
        creator.use_lzma(true);
        let tc = creator.create(vec![stat_entry("fox.txt")], 1).unwrap();
        creator.wait();
        assert_eq!(tc.successes(), 1, "log: {:?}", tc.entry(0));
    });

    let mut archive = ZipFile::open(&zip).unwrap();
    assert_eq!(archive.localheaders()[0].compression, ZIP_LZMA);
    assert!(archive.localheaders()[0].compressed_size < text.len() as u64);

    let out = TempDir::new().unwrap();
    let tc = archive.unzip(out.path().to_str().unwrap(), 1).unwrap();
    archive.wait();
    assert_eq!(tc.successes(), 1, "log: {:?}", tc.entry(0));
    assert_eq!(std::fs::read(out.path().join("fox.txt")).unwrap(), text);
}

/// Pack → unpack over several threads: identical bytes come back, every
/// stored CRC matches the source and the directory order matches the
/// submission order.
#[test]
fn multi_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let inputs: Vec<(String, Vec<u8>)> = (0..12)
        .map(|i| {
            let name = format!("f{i:02}.bin");
            let data = match i % 3 {
                0 => vec![b'a' + i as u8; 200],                  // stores
                1 => xorshift_bytes(64 * 1024 + i * 1111),       // stores via probe
                _ => b"pattern ".iter().cycle().take(90_000 + i * 7).copied().collect(),
            };
            (name, data)
        })
        .collect();
    for (name, data) in &inputs {
        std::fs::write(dir.path().join(name), data).unwrap();
    }

    let zip = dir.path().join("multi.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("multi.zip");
        creator.use_lzma(true);
        let files = inputs.iter().map(|(n, _)| stat_entry(n)).collect();
        let tc = creator.create(files, 4).unwrap();
        creator.wait();
        assert_eq!(tc.successes(), inputs.len());
        assert_eq!(tc.total(), inputs.len());
    });

    let mut archive = ZipFile::open(&zip).unwrap();
    assert_eq!(archive.size(), inputs.len());
    for (i, (name, data)) in inputs.iter().enumerate() {
        let lh = &archive.localheaders()[i];
        assert_eq!(&lh.fname, name, "submission order must be preserved");
        assert_eq!(lh.crc32, crc32_blocks(data));
        assert_eq!(lh.uncompressed_size, data.len() as u64);
        // Sentinels on disk, ZIP64 extra carrying the truth.
        let extra = &lh.extra;
        assert_eq!(u16::from_le_bytes([extra[0], extra[1]]), 0x0001);
        assert_eq!(u16::from_le_bytes([extra[2], extra[3]]), 28);
    }

    let out = TempDir::new().unwrap();
    let tc = archive.unzip(out.path().to_str().unwrap(), 4).unwrap();
    archive.wait();
    assert_eq!(tc.state(), TaskState::Finished);
    assert_eq!(tc.successes(), inputs.len());
    for (name, data) in &inputs {
        assert_eq!(&std::fs::read(out.path().join(name)).unwrap(), data);
    }
}

/// With one thread and pinned timestamps, two runs over the same input are
/// byte-identical.
#[test]
fn single_thread_runs_are_deterministic() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"deterministic?").unwrap();
    let mixed: Vec<u8> = b"half text half noise "
        .iter()
        .cycle()
        .take(128 * 1024)
        .copied()
        .collect();
    std::fs::write(dir.path().join("b.bin"), &mixed).unwrap();

    let mut archives = Vec::new();
    for round in 0..2 {
        let name = format!("round{round}.zip");
        in_dir(dir.path(), || {
            let mut creator = ZipCreator::new(&name);
            creator.use_lzma(true);
            let tc = creator
                .create(vec![stat_entry("a.txt"), stat_entry("b.bin")], 1)
                .unwrap();
            creator.wait();
            assert_eq!(tc.successes(), 2);
        });
        archives.push(std::fs::read(dir.path().join(&name)).unwrap());
    }
    assert_eq!(archives[0], archives[1]);
}

/// Empty regular files are legal entries.
#[test]
fn empty_file_round_trip() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("empty.dat"), b"").unwrap();

    let zip = dir.path().join("empty.zip");
    in_dir(dir.path(), || {
        let mut creator = ZipCreator::new("empty.zip");
        let tc = creator.create(vec![stat_entry("empty.dat")], 1).unwrap();
        creator.wait();
        assert_eq!(tc.successes(), 1, "log: {:?}", tc.entry(0));
    });

    let mut archive = ZipFile::open(&zip).unwrap();
    assert_eq!(archive.localheaders()[0].uncompressed_size, 0);
    let out = TempDir::new().unwrap();
    let tc = archive.unzip(out.path().to_str().unwrap(), 1).unwrap();
    archive.wait();
    assert_eq!(tc.successes(), 1);
    assert_eq!(std::fs::read(out.path().join("empty.dat")).unwrap(), b"");
}
