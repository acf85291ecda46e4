#![no_main]

use captn::envfilter::{filter_env, EnvFilterConfig};
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

fuzz_target!(|data: (String, String, String, Vec<String>, Vec<String>)| {
    let (container_name, key, value, exclude_patterns, preserve_patterns) = data;

    let mut old_env = BTreeMap::new();
    old_env.insert(key, value);
    let image_env = BTreeMap::new();

    let config = EnvFilterConfig {
        enabled: true,
        exclude_patterns,
        preserve_patterns,
        container_specific_rules: BTreeMap::new(),
    };

    // Glob patterns come from untrusted config; none of them should make
    // this panic, however pathological (empty, unmatched brackets, stray
    // backslashes).
    let _ = filter_env(&container_name, &old_env, &image_env, &config);
});
