#![no_main]

use captn::lock::LockInfo;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // A lock file is attacker-reachable only insofar as it's
    // operator-writable state, but parsing it must still never panic on
    // truncated or malformed JSON.
    if let Ok(info) = serde_json::from_str::<LockInfo>(text) {
        let reencoded = serde_json::to_string(&info).expect("re-encoding a parsed LockInfo");
        let reparsed: LockInfo =
            serde_json::from_str(&reencoded).expect("re-parsing captn's own encoding");
        assert_eq!(info.pid, reparsed.pid);
        assert_eq!(info.hostname, reparsed.hostname);
    }
});
