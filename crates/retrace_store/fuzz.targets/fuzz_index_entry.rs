#![no_main]
use libfuzzer_sys::fuzz_target;
use retrace_store::IndexEntry;
use retrace_store::meta::SessionMeta;

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = IndexEntry::decode(data) {
        let again = IndexEntry::decode(&entry.encode()).unwrap();
        assert_eq!(again.header, entry.header);
        assert_eq!(again.payload_offset, entry.payload_offset);
    }
    let _ = SessionMeta::decode(data);
});
