#![no_main]
use libfuzzer_sys::fuzz_target;

use parzip::zipdefs::{find_unix_extra, find_zip64_sizes};

fuzz_target!(|data: &[u8]| {
    // Extra-field walkers see attacker-controlled bytes straight out of the
    // archive map; they may reject them but never read out of bounds.
    let _ = find_zip64_sizes(data);
    let _ = find_unix_extra(data);

    // The natural-order comparator runs over entry names of any shape.
    // Split the input in two and make sure comparing both ways terminates
    // and agrees.
    let mid = data.len() / 2;
    let a = String::from_utf8_lossy(&data[..mid]);
    let b = String::from_utf8_lossy(&data[mid..]);
    let forward = parzip::natural_compare(&a, &b);
    let backward = parzip::natural_compare(&b, &a);
    assert_eq!(forward, backward.reverse());
});
