#![no_main]

use captn::config::CaptnConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing arbitrary TOML must never panic, and a config that parses
    // must be able to run `validate()` and `resolve_rule()` without
    // panicking either, whatever garbage the assignment/rule tables hold.
    if let Ok(config) = CaptnConfig::from_str(text) {
        let _ = config.validate();
        let _ = config.resolve_rule("fuzz-container", None);
    }
});
