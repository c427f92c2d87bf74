#![no_main]

use libfuzzer_sys::fuzz_target;
use callbench::config::SortKey;
use callbench::privilege::Identity;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = input.parse::<Identity>();
        let _ = input.parse::<SortKey>();
    }
});
