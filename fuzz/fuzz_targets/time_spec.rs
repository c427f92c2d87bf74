#![no_main]

use libfuzzer_sys::fuzz_target;
use callbench::config::{parse_duration, parse_durations};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Must reject or parse without panicking, including on overflow
        let _ = parse_duration(input);
        let parts: Vec<&str> = input.split_whitespace().collect();
        let _ = parse_durations(&parts);
    }
});
