//! Session metadata record.
//!
//! Layout v1, little-endian:
//!
//! ```text
//!  0  magic "RTSM"        4  u16 version      6  u8 status     7  u8 reserved
//!  8  [u8;16] session id 24  u32 pid         28  i64 start     36  i64 clock offset
//! 44  i64 end            52  u64 event count 60  u64 truncated-at (u64::MAX = none)
//! 68  u8 has-minidump    69  [u8;7] reserved 76  u16 path len  78  path bytes
//!  .. u32 checksum of everything before it
//! ```
//!
//! After creation only the status byte, the block from `end` to
//! `has-minidump` and the checksum change; they are rewritten in place. A
//! record whose checksum fails can still be salvaged for its fixed fields.

use crate::error::{StoreError, StoreResult};
use bytes::{Buf, BufMut};
use retrace_core::{ClockOffset, Digest, FormatVersion, SessionId, WallTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// File magic
pub const META_MAGIC: [u8; 4] = *b"RTSM";
/// Offset of the status byte
pub const STATUS_OFFSET: usize = 6;
/// End time, event count, truncation point and minidump flag
pub const MUTABLE_FIELDS: Range<usize> = 44..69;
const FIXED_LEN: usize = 78;
const NO_TRUNCATION: u64 = u64::MAX;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionStatus {
    /// A recorder is (or was) writing
    Recording = 0,
    /// Target exited cleanly or recording was stopped
    Complete = 1,
    /// Target terminated abnormally
    Crashed = 2,
    /// Writer was lost; the tail was truncated on open
    Corrupt = 3,
}

impl SessionStatus {
    /// Decode the status byte
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Recording),
            1 => Some(Self::Complete),
            2 => Some(Self::Crashed),
            3 => Some(Self::Corrupt),
            _ => None,
        }
    }

    /// Whether the session will never change again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Recording)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Recording => "recording",
            Self::Complete => "complete",
            Self::Crashed => "crashed",
            Self::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

/// Session metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Session-unique key
    pub session_id: SessionId,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Traced executable
    pub target_path: String,
    /// Traced process id
    pub process_id: u32,
    /// Wall time recording started
    pub start_time: WallTime,
    /// Wall ns at monotonic zero
    pub clock_offset: ClockOffset,
    /// Wall time recording ended; `None` while recording
    pub end_time: Option<WallTime>,
    /// Committed events, as of the last metadata write
    pub event_count: u64,
    /// First index dropped by recovery
    pub truncated_at: Option<u64>,
    /// Whether `crash.dmp` is linked
    pub has_minidump: bool,
}

impl SessionMeta {
    /// Metadata for a new recording
    #[must_use]
    pub fn new(target_path: impl Into<String>, process_id: u32, start_time: WallTime) -> Self {
        Self {
            session_id: SessionId::new(),
            status: SessionStatus::Recording,
            target_path: target_path.into(),
            process_id,
            start_time,
            clock_offset: ClockOffset::from_wall(start_time),
            end_time: None,
            event_count: 0,
            truncated_at: None,
            has_minidump: false,
        }
    }

    /// Encode to the on-disk layout
    ///
    /// # Errors
    ///
    /// Returns error if the target path is longer than 65535 bytes
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let path = self.target_path.as_bytes();
        let path_len = u16::try_from(path.len())
            .map_err(|_| StoreError::corrupt("target path longer than 65535 bytes"))?;

        let mut buf = Vec::with_capacity(FIXED_LEN + path.len() + 4);
        buf.put_slice(&META_MAGIC);
        buf.put_u16_le(FormatVersion::CURRENT.as_u16());
        buf.put_u8(self.status as u8);
        buf.put_u8(0);
        buf.put_slice(self.session_id.as_bytes());
        buf.put_u32_le(self.process_id);
        buf.put_i64_le(self.start_time.as_unix_nanos());
        buf.put_i64_le(self.clock_offset.as_nanos());
        buf.put_i64_le(self.end_time.map_or(0, |t| t.as_unix_nanos()));
        buf.put_u64_le(self.event_count);
        buf.put_u64_le(self.truncated_at.unwrap_or(NO_TRUNCATION));
        buf.put_u8(u8::from(self.has_minidump));
        buf.put_bytes(0, 7);
        buf.put_u16_le(path_len);
        buf.put_slice(path);
        let checksum = Digest::short(&buf);
        buf.put_u32_le(checksum);
        Ok(buf)
    }

    /// Byte ranges of `encoded` that change after creation, checksum last
    #[must_use]
    pub fn rewritten_ranges(encoded: &[u8]) -> [Range<usize>; 3] {
        let checksum_at = encoded.len().saturating_sub(4);
        [
            STATUS_OFFSET..STATUS_OFFSET + 1,
            MUTABLE_FIELDS,
            checksum_at..encoded.len(),
        ]
    }

    /// Decode and verify
    ///
    /// # Errors
    ///
    /// Returns error on bad magic, unsupported version, short input or
    /// checksum mismatch
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        Self::parse(data, true)
    }

    /// Decode a record whose checksum failed, as left by a torn in-place
    /// rewrite. The fixed fields are kept; the fields that were being
    /// rewritten are reset and the status reads `Recording`, so the session
    /// goes through writer-loss recovery.
    ///
    /// # Errors
    ///
    /// Returns error on bad magic, unsupported version or short input
    pub fn salvage(data: &[u8]) -> StoreResult<Self> {
        let mut meta = Self::parse(data, false)?;
        meta.status = SessionStatus::Recording;
        meta.end_time = None;
        meta.event_count = 0;
        meta.truncated_at = None;
        meta.has_minidump = false;
        Ok(meta)
    }

    fn parse(data: &[u8], verify: bool) -> StoreResult<Self> {
        if data.len() < FIXED_LEN + 4 {
            return Err(StoreError::corrupt("session.meta is truncated"));
        }
        if data[..4] != META_MAGIC {
            return Err(StoreError::BadMagic {
                file: "session.meta",
            });
        }

        let mut cur = &data[4..];
        FormatVersion::check(cur.get_u16_le()).map_err(|source| StoreError::Version {
            file: "session.meta",
            source,
        })?;
        let raw_status = cur.get_u8();
        cur.advance(1);
        let mut id = [0u8; 16];
        cur.copy_to_slice(&mut id);
        let process_id = cur.get_u32_le();
        let start = cur.get_i64_le();
        let offset = cur.get_i64_le();
        let end = cur.get_i64_le();
        let event_count = cur.get_u64_le();
        let truncated_at = cur.get_u64_le();
        let has_minidump = cur.get_u8() != 0;
        cur.advance(7);
        let path_len = usize::from(cur.get_u16_le());

        let body_len = FIXED_LEN + path_len;
        if data.len() < body_len + 4 {
            return Err(StoreError::corrupt("session.meta path is truncated"));
        }
        let path = &data[FIXED_LEN..body_len];
        let stored = (&data[body_len..body_len + 4]).get_u32_le();
        if verify && Digest::short(&data[..body_len]) != stored {
            return Err(StoreError::corrupt("session.meta checksum mismatch"));
        }
        let status = match SessionStatus::from_u8(raw_status) {
            Some(status) => status,
            None if !verify => SessionStatus::Recording,
            None => return Err(StoreError::corrupt("session.meta has unknown status")),
        };

        Ok(Self {
            session_id: SessionId::from_bytes(id),
            status,
            target_path: String::from_utf8_lossy(path).into_owned(),
            process_id,
            start_time: WallTime::from_unix_nanos(start),
            clock_offset: ClockOffset::from_wall(WallTime::from_unix_nanos(offset)),
            end_time: (end != 0).then(|| WallTime::from_unix_nanos(end)),
            event_count,
            truncated_at: (truncated_at != NO_TRUNCATION).then_some(truncated_at),
            has_minidump,
        })
    }
}
