//! Strict minidump reader.
//!
//! Every offset and length is checked against the input before use. Any
//! malformation rejects the whole file; there is no partial result.

use crate::error::{DumpError, DumpResult};
use crate::format::{
    DIRECTORY_ENTRY_SIZE, HEADER_SIZE, MAGIC, MemoryRange, Minidump, ModuleRecord, StreamKind,
    SystemInfo, ThreadRecord,
};
use bytes::Buf;
use retrace_core::{FormatVersion, SessionId, WallTime};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Bounds-checked little-endian reader over one stream
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> DumpResult<()> {
        if self.buf.remaining() < n {
            return Err(DumpError::invalid(format!(
                "{} truncated: need {n} bytes, {} left",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u16(&mut self) -> DumpResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> DumpResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> DumpResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn take(&mut self, n: usize) -> DumpResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn blob32(&mut self) -> DumpResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn str16(&mut self) -> DumpResult<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DumpError::invalid(format!("{} holds a non-UTF-8 string", self.what)))
    }

    /// Element count, refused if the stream cannot possibly hold that many
    fn count(&mut self, min_element: usize) -> DumpResult<usize> {
        let n = self.u32()? as usize;
        if n.saturating_mul(min_element) > self.buf.remaining() {
            return Err(DumpError::invalid(format!(
                "{} claims {n} elements in {} bytes",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(n)
    }

    fn finish(&self) -> DumpResult<()> {
        if self.buf.has_remaining() {
            return Err(DumpError::invalid(format!(
                "{} has {} trailing bytes",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

fn system_info(data: &[u8]) -> DumpResult<SystemInfo> {
    let mut r = Reader::new(data, "system info stream");
    let info = SystemInfo {
        arch: r.str16()?,
        cpu_count: r.u32()?,
        uname: r.str16()?,
    };
    r.finish()?;
    Ok(info)
}

fn thread_list(data: &[u8]) -> DumpResult<Vec<ThreadRecord>> {
    let mut r = Reader::new(data, "thread list stream");
    let n = r.count(24)?;
    let mut threads = Vec::with_capacity(n);
    for _ in 0..n {
        let tid = r.u32()?;
        let _reserved = r.u32()?;
        let registers = r.blob32()?;
        let stack_start = r.u64()?;
        let stack = r.blob32()?;
        threads.push(ThreadRecord {
            tid,
            registers,
            stack_start,
            stack,
        });
    }
    r.finish()?;
    Ok(threads)
}

fn module_list(data: &[u8]) -> DumpResult<Vec<ModuleRecord>> {
    let mut r = Reader::new(data, "module list stream");
    let n = r.count(18)?;
    let mut modules = Vec::with_capacity(n);
    for _ in 0..n {
        modules.push(ModuleRecord {
            base: r.u64()?,
            size: r.u64()?,
            path: r.str16()?,
        });
    }
    r.finish()?;
    Ok(modules)
}

fn memory_list(data: &[u8]) -> DumpResult<Vec<MemoryRange>> {
    let mut r = Reader::new(data, "memory list stream");
    let n = r.count(12)?;
    let mut ranges = Vec::with_capacity(n);
    for _ in 0..n {
        ranges.push(MemoryRange {
            start: r.u64()?,
            bytes: r.blob32()?,
        });
    }
    r.finish()?;
    Ok(ranges)
}

/// Parse an in-memory minidump
///
/// # Errors
///
/// Returns [`DumpError::InvalidFormat`] on bad magic, unsupported version,
/// out-of-bounds streams, duplicate streams or malformed stream contents
pub fn parse(data: &[u8]) -> DumpResult<Minidump> {
    if data.len() < HEADER_SIZE {
        return Err(DumpError::invalid(format!(
            "header truncated: {} of {HEADER_SIZE} bytes",
            data.len()
        )));
    }
    let mut header = Reader::new(&data[..HEADER_SIZE], "header");
    let magic = header.take(4)?;
    if magic != MAGIC {
        return Err(DumpError::invalid("bad magic"));
    }
    FormatVersion::check(header.u16()?).map_err(|e| DumpError::invalid(e.to_string()))?;
    let stream_count = usize::from(header.u16()?);
    let mut id = [0u8; 16];
    id.copy_from_slice(header.take(16)?);
    let crash_ns = header.u64()? as i64;
    let fault_tid = header.u32()?;
    let signal = header.u32()?;
    let fault_addr = header.u64()?;

    let dir_end = HEADER_SIZE + stream_count * DIRECTORY_ENTRY_SIZE;
    if dir_end > data.len() {
        return Err(DumpError::invalid(format!(
            "directory of {stream_count} streams exceeds file length {}",
            data.len()
        )));
    }

    let mut dump = Minidump::new(
        SessionId::from_bytes(id),
        WallTime::from_unix_nanos(crash_ns),
        fault_tid,
        signal,
    );
    dump.fault_addr = fault_addr;

    let mut directory = Reader::new(&data[HEADER_SIZE..dir_end], "directory");
    let mut seen = HashSet::new();
    for _ in 0..stream_count {
        let kind = directory.u32()?;
        let _reserved = directory.u32()?;
        let offset = directory.u64()?;
        let len = directory.u64()?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= data.len() as u64 && offset >= dir_end as u64)
            .ok_or_else(|| {
                DumpError::invalid(format!(
                    "stream kind {kind} at {offset}+{len} is outside the file"
                ))
            })?;
        if !seen.insert(kind) {
            return Err(DumpError::invalid(format!("duplicate stream kind {kind}")));
        }
        let stream = &data[offset as usize..end as usize];
        match StreamKind::from_u32(kind) {
            Some(StreamKind::SystemInfo) => dump.system = system_info(stream)?,
            Some(StreamKind::ThreadList) => dump.threads = thread_list(stream)?,
            Some(StreamKind::ModuleList) => dump.modules = module_list(stream)?,
            Some(StreamKind::MemoryList) => dump.memory = memory_list(stream)?,
            None => debug!(kind, len, "Skipping unknown minidump stream"),
        }
    }
    Ok(dump)
}

/// Read and parse a minidump file
///
/// # Errors
///
/// Returns [`DumpError::Io`] if the file cannot be read, otherwise as [`parse`]
pub fn load(path: &Path) -> DumpResult<Minidump> {
    let data = std::fs::read(path).map_err(|e| DumpError::Io {
        operation: format!("read minidump {}", path.display()),
        reason: e.to_string(),
    })?;
    parse(&data)
}
