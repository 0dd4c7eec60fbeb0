#![no_main]
use libfuzzer_sys::fuzz_target;
use retrace_dump::{encode, parse};

fuzz_target!(|data: &[u8]| {
    // Malformed input is an error, never a panic
    if let Ok(dump) = parse(data) {
        assert_eq!(parse(&encode(&dump)).unwrap(), dump);
    }
});
