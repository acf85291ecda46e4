#![no_main]

use captn::pattern::TagPattern;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(reference_tag) = std::str::from_utf8(data) else {
        return;
    };

    // An induced pattern must always match the exact tag it was built
    // from, whatever that tag looks like.
    if let Some(pattern) = TagPattern::induce(reference_tag) {
        assert!(pattern.matches(reference_tag).is_some());
    }
});
