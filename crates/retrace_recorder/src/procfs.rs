//! `/proc` readers.

use crate::error::{RecorderError, RecorderResult};
use retrace_dump::ModuleRecord;
use std::path::{Path, PathBuf};

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// First address
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// Permission string, e.g. `r-xp`
    pub perms: String,
    /// File offset
    pub offset: u64,
    /// Backing file or pseudo-path such as `[heap]`
    pub path: Option<String>,
}

/// Parse the text of a maps file; malformed lines are skipped
#[must_use]
pub fn parse_maps(text: &str) -> Vec<Mapping> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.to_string();
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let rest: Vec<&str> = fields.collect();
    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        path: (!rest.is_empty()).then(|| rest.join(" ")),
    })
}

/// Read `/proc/<pid>/maps`
///
/// # Errors
///
/// Returns error if the file cannot be read
pub fn read_maps(pid: u32) -> RecorderResult<Vec<Mapping>> {
    let path = format!("/proc/{pid}/maps");
    let text = std::fs::read_to_string(&path).map_err(|e| RecorderError::Tracer {
        reason: format!("read {path}: {e}"),
    })?;
    Ok(parse_maps(&text))
}

/// Start of the `[heap]` mapping
#[must_use]
pub fn heap_start(maps: &[Mapping]) -> Option<u64> {
    maps.iter()
        .find(|m| m.path.as_deref() == Some("[heap]"))
        .map(|m| m.start)
}

/// File-backed mappings grouped by file, in address order
#[must_use]
pub fn modules(maps: &[Mapping]) -> Vec<ModuleRecord> {
    let mut out: Vec<ModuleRecord> = Vec::new();
    for m in maps {
        let Some(path) = m.path.as_deref().filter(|p| p.starts_with('/')) else {
            continue;
        };
        match out.iter_mut().find(|r| r.path == path) {
            Some(record) => {
                let end = record.base.saturating_add(record.size).max(m.end);
                record.base = record.base.min(m.start);
                record.size = end - record.base;
            }
            None => out.push(ModuleRecord {
                base: m.start,
                size: m.end - m.start,
                path: path.to_string(),
            }),
        }
    }
    out.sort_by_key(|r| r.base);
    out
}

/// Address the executable at `exe` was mapped at
#[must_use]
pub fn load_base(maps: &[Mapping], exe: &Path) -> Option<u64> {
    let exe = exe.to_str()?;
    maps.iter()
        .filter(|m| m.path.as_deref() == Some(exe) && m.offset == 0)
        .map(|m| m.start)
        .min()
}

/// Threads of a process
#[must_use]
pub fn thread_ids(pid: u32) -> Vec<u32> {
    let Ok(dir) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    let mut tids: Vec<u32> = dir
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    tids
}

/// Executable of a process
#[must_use]
pub fn exe_path(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

/// Kernel name and release, e.g. `Linux 6.1.0`
#[must_use]
pub fn uname() -> String {
    let read = |name: &str| {
        std::fs::read_to_string(format!("/proc/sys/kernel/{name}"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    format!("{} {}", read("ostype"), read("osrelease")).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c2a00000-55d0c2a02000 r--p 00000000 08:01 1234   /usr/bin/demo
55d0c2a02000-55d0c2a05000 r-xp 00002000 08:01 1234   /usr/bin/demo
55d0c3b00000-55d0c3b21000 rw-p 00000000 00:00 0      [heap]
7f1e2c000000-7f1e2c028000 r--p 00000000 08:01 99     /usr/lib/x86_64-linux-gnu/libc.so.6
7f1e2c028000-7f1e2c1bd000 r-xp 00028000 08:01 99     /usr/lib/x86_64-linux-gnu/libc.so.6
7f1e2c300000-7f1e2c301000 rw-p 00000000 00:00 0
7ffd1a000000-7ffd1a021000 rw-p 00000000 00:00 0      [stack]
garbage line
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 7);
        assert_eq!(maps[1].perms, "r-xp");
        assert_eq!(maps[1].offset, 0x2000);
        assert_eq!(maps[5].path, None);
        assert_eq!(heap_start(&maps), Some(0x55d0_c3b0_0000));
    }

    #[test]
    fn test_modules_grouped() {
        let maps = parse_maps(MAPS);
        let mods = modules(&maps);
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].path, "/usr/bin/demo");
        assert_eq!(mods[0].size, 0x5000);
        assert_eq!(mods[1].base, 0x7f1e_2c00_0000);
        assert_eq!(mods[1].size, 0x1bd000);
    }

    #[test]
    fn test_load_base() {
        let maps = parse_maps(MAPS);
        assert_eq!(load_base(&maps, Path::new("/usr/bin/demo")), Some(0x55d0_c2a0_0000));
        assert_eq!(load_base(&maps, Path::new("/bin/other")), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_process() {
        let pid = std::process::id();
        assert!(!read_maps(pid).unwrap().is_empty());
        assert!(thread_ids(pid).contains(&pid));
        assert!(exe_path(pid).is_some());
    }
}
