#![no_main]

use captn::version::{classify, compare, parse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(tag) = std::str::from_utf8(data) else {
        return;
    };

    let Some(version) = parse(tag) else {
        return;
    };

    // A parsed version always compares equal to itself within its own
    // scheme, and classifying it against itself never reports a major or
    // minor bump.
    assert_eq!(compare(&version, &version), Some(std::cmp::Ordering::Equal));

    let diff = classify(&version, &version, "sha256:a", "sha256:a");
    assert_ne!(diff, captn::types::DiffKind::Major);
    assert_ne!(diff, captn::types::DiffKind::Minor);
});
