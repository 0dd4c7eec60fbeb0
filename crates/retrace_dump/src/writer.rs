//! Minidump writer.

use crate::format::{DIRECTORY_ENTRY_SIZE, HEADER_SIZE, MAGIC, Minidump, StreamKind};
use bytes::BufMut;
use retrace_core::FormatVersion;

fn put_str16(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(usize::from(u16::MAX));
    buf.put_u16_le(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn put_blob32(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(u32::MAX as usize);
    buf.put_u32_le(len as u32);
    buf.put_slice(&bytes[..len]);
}

fn count32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn streams(dump: &Minidump) -> Vec<(StreamKind, Vec<u8>)> {
    let mut system = Vec::new();
    put_str16(&mut system, &dump.system.arch);
    system.put_u32_le(dump.system.cpu_count);
    put_str16(&mut system, &dump.system.uname);

    let mut threads = Vec::new();
    threads.put_u32_le(count32(dump.threads.len()));
    for t in &dump.threads {
        threads.put_u32_le(t.tid);
        threads.put_u32_le(0);
        put_blob32(&mut threads, &t.registers);
        threads.put_u64_le(t.stack_start);
        put_blob32(&mut threads, &t.stack);
    }

    let mut modules = Vec::new();
    modules.put_u32_le(count32(dump.modules.len()));
    for m in &dump.modules {
        modules.put_u64_le(m.base);
        modules.put_u64_le(m.size);
        put_str16(&mut modules, &m.path);
    }

    let mut memory = Vec::new();
    memory.put_u32_le(count32(dump.memory.len()));
    for r in &dump.memory {
        memory.put_u64_le(r.start);
        put_blob32(&mut memory, &r.bytes);
    }

    vec![
        (StreamKind::SystemInfo, system),
        (StreamKind::ThreadList, threads),
        (StreamKind::ModuleList, modules),
        (StreamKind::MemoryList, memory),
    ]
}

/// Encode a minidump
#[must_use]
pub fn encode(dump: &Minidump) -> Vec<u8> {
    let streams = streams(dump);
    let body: usize = streams.iter().map(|(_, s)| s.len()).sum();
    let mut out = Vec::with_capacity(HEADER_SIZE + streams.len() * DIRECTORY_ENTRY_SIZE + body);

    out.put_slice(&MAGIC);
    out.put_u16_le(FormatVersion::CURRENT.as_u16());
    out.put_u16_le(streams.len() as u16);
    out.put_slice(dump.session_id.as_bytes());
    out.put_i64_le(dump.crash_time.as_unix_nanos());
    out.put_u32_le(dump.fault_tid);
    out.put_u32_le(dump.signal);
    out.put_u64_le(dump.fault_addr);

    let mut offset = (HEADER_SIZE + streams.len() * DIRECTORY_ENTRY_SIZE) as u64;
    for (kind, data) in &streams {
        out.put_u32_le(*kind as u32);
        out.put_u32_le(0);
        out.put_u64_le(offset);
        out.put_u64_le(data.len() as u64);
        offset += data.len() as u64;
    }
    for (_, data) in &streams {
        out.put_slice(data);
    }
    out
}
