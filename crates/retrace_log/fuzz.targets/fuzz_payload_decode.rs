#![no_main]
use libfuzzer_sys::fuzz_target;
use retrace_log::Payload;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must not panic
    if let Ok(payload) = Payload::decode(data) {
        let encoded = payload.encode().unwrap();
        assert_eq!(Payload::decode(&encoded).unwrap(), payload);
    }
});
