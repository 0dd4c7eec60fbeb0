//! Fixed-width index entries.
//!
//! Each entry is 64 bytes and carries its own checksum, so a torn or
//! bit-flipped entry is detected without reading anything else:
//!
//! ```text
//!  0 u64 index      8 u64 timestamp   16 u8 category   17 u8 reserved
//! 18 u16 threads   20 u32 tid         24 u32 code      28 u64 duration
//! 36 i64 result    44 u64 payload offset               52 u32 payload length
//! 56 u32 payload digest               60 u32 checksum of bytes 0..60
//! ```

use crate::error::{StoreError, StoreResult};
use bytes::{Buf, BufMut};
use retrace_core::{Digest, FormatVersion, MonoTime};
use retrace_log::{Category, EventHeader};

/// Bytes per index entry
pub const ENTRY_SIZE: usize = 64;
/// Bytes before the first entry in `events.idx`
pub const INDEX_HEADER_SIZE: u64 = 16;
/// Bytes before the first blob in `payload.bin`
pub const PAYLOAD_HEADER_SIZE: u64 = 16;
/// `events.idx` magic
pub const INDEX_MAGIC: [u8; 4] = *b"RTIX";
/// `payload.bin` magic
pub const PAYLOAD_MAGIC: [u8; 4] = *b"RTPL";

/// One decoded index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Event header fields
    pub header: EventHeader,
    /// Absolute offset of the payload in `payload.bin`
    pub payload_offset: u64,
    /// Payload length in bytes
    pub payload_len: u32,
    /// Truncated digest of the payload bytes
    pub payload_digest: u32,
}

impl IndexEntry {
    /// Entry for `header` whose payload sits at `payload_offset`
    #[must_use]
    pub fn new(header: EventHeader, payload_offset: u64, payload: &[u8]) -> Self {
        Self {
            header,
            payload_offset,
            payload_len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            payload_digest: Digest::short(payload),
        }
    }

    /// End of the payload blob in `payload.bin`
    #[must_use]
    pub fn payload_end(&self) -> u64 {
        self.payload_offset + u64::from(self.payload_len)
    }

    /// File offset of entry `index` in `events.idx`
    #[must_use]
    pub fn file_offset(index: u64) -> u64 {
        INDEX_HEADER_SIZE + index * ENTRY_SIZE as u64
    }

    /// Encode to 64 bytes
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let h = &self.header;
        let mut out = [0u8; ENTRY_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(h.index);
        buf.put_u64_le(h.timestamp.as_nanos());
        buf.put_u8(h.category.as_u8());
        buf.put_u8(0);
        buf.put_u16_le(h.thread_count);
        buf.put_u32_le(h.thread_id);
        buf.put_u32_le(h.code);
        buf.put_u64_le(h.duration);
        buf.put_i64_le(h.result);
        buf.put_u64_le(self.payload_offset);
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(self.payload_digest);
        let checksum = Digest::short(&out[..60]);
        out[60..].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Decode and verify the checksum
    ///
    /// # Errors
    ///
    /// Returns error on short input, checksum mismatch or unknown category
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        if data.len() < ENTRY_SIZE {
            return Err(StoreError::corrupt("index entry is truncated"));
        }
        let stored = (&data[60..64]).get_u32_le();
        if Digest::short(&data[..60]) != stored {
            return Err(StoreError::corrupt("index entry checksum mismatch"));
        }

        let mut cur = &data[..60];
        let index = cur.get_u64_le();
        let timestamp = MonoTime::from_nanos(cur.get_u64_le());
        let category = Category::from_u8(cur.get_u8())
            .ok_or_else(|| StoreError::corrupt("index entry has unknown category"))?;
        cur.advance(1);
        let thread_count = cur.get_u16_le();
        let thread_id = cur.get_u32_le();
        let code = cur.get_u32_le();
        let duration = cur.get_u64_le();
        let result = cur.get_i64_le();
        let payload_offset = cur.get_u64_le();
        let payload_len = cur.get_u32_le();
        let payload_digest = cur.get_u32_le();

        Ok(Self {
            header: EventHeader {
                index,
                timestamp,
                category,
                code,
                thread_id,
                thread_count,
                duration,
                result,
            },
            payload_offset,
            payload_len,
            payload_digest,
        })
    }
}

/// Encode a 16-byte file header
#[must_use]
pub fn encode_file_header(magic: [u8; 4], extra: u16) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut buf = &mut out[..];
    buf.put_slice(&magic);
    buf.put_u16_le(FormatVersion::CURRENT.as_u16());
    buf.put_u16_le(extra);
    out
}

/// Verify a 16-byte file header; returns the extra word
///
/// # Errors
///
/// Returns error on short input, bad magic or unsupported version
pub fn decode_file_header(file: &'static str, magic: [u8; 4], data: &[u8]) -> StoreResult<u16> {
    if data.len() < 16 {
        return Err(StoreError::corrupt(format!("{file} header is truncated")));
    }
    if data[..4] != magic {
        return Err(StoreError::BadMagic { file });
    }
    let mut cur = &data[4..8];
    FormatVersion::check(cur.get_u16_le()).map_err(|source| StoreError::Version { file, source })?;
    Ok(cur.get_u16_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry() -> IndexEntry {
        let header = EventHeader::new(5, MonoTime::from_nanos(1234), Category::Syscall, 257)
            .with_thread(4321, 3)
            .with_outcome(99, -2);
        IndexEntry::new(header, 16, b"payload")
    }

    #[test]
    fn test_entry_roundtrip() {
        let e = entry();
        let bytes = e.encode();
        assert_eq!(IndexEntry::decode(&bytes).unwrap(), e);
    }

    #[test]
    fn test_entry_detects_any_flip() {
        let bytes = entry().encode();
        for i in 0..ENTRY_SIZE {
            let mut bad = bytes;
            bad[i] ^= 1;
            assert!(IndexEntry::decode(&bad).is_err(), "flip at {i} undetected");
        }
    }

    #[test]
    fn test_entry_short() {
        assert!(IndexEntry::decode(&entry().encode()[..63]).is_err());
    }

    #[test]
    fn test_file_offsets() {
        assert_eq!(IndexEntry::file_offset(0), 16);
        assert_eq!(IndexEntry::file_offset(2), 16 + 128);
        assert_eq!(entry().payload_end(), 16 + 7);
    }

    #[test]
    fn test_file_header() {
        let h = encode_file_header(INDEX_MAGIC, ENTRY_SIZE as u16);
        assert_eq!(decode_file_header("events.idx", INDEX_MAGIC, &h).unwrap(), 64);
        assert!(matches!(
            decode_file_header("payload.bin", PAYLOAD_MAGIC, &h),
            Err(StoreError::BadMagic { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_entry_roundtrip(index: u64, ts: u64, code: u32, tid: u32, threads: u16,
                                duration: u64, result: i64, offset: u64, len: u32, digest: u32) {
            let header = EventHeader::new(index, MonoTime::from_nanos(ts), Category::Signal, code)
                .with_thread(tid, threads)
                .with_outcome(duration, result);
            let e = IndexEntry { header, payload_offset: offset, payload_len: len, payload_digest: digest };
            prop_assert_eq!(IndexEntry::decode(&e.encode()).unwrap(), e);
        }
    }
}
