#![no_main]
use libfuzzer_sys::fuzz_target;

use std::io::Write;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes through the archive parser.
    // Err results are expected and fine; what we verify is no panics or UB.
    //
    // ZipFile maps its input, so the bytes have to go through a real file.
    let mut f = tempfile::NamedTempFile::new().expect("could not create fuzz input file");
    f.write_all(data).expect("could not write fuzz input");
    f.flush().expect("could not flush fuzz input");

    // Every structural violation must surface as an error: mismatched
    // counts, bogus signatures, truncated records, missing ZIP64 extras,
    // encrypted or absolutely-named entries.
    let _ = parzip::ZipFile::open(f.path());
});
