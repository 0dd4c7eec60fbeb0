//! One-line event summaries.

use retrace_log::{Category, EventHeader, Payload, Section, errno_name, event_name};
use std::fmt::Write;

/// Longest string argument shown
const STRING_PREVIEW: usize = 48;

/// Results at or above this print as hex
const HEX_THRESHOLD: i64 = 0xffff;

fn printable(byte: u8) -> bool {
    byte.is_ascii_graphic() || byte == b' '
}

/// Leading printable run of `bytes`, up to the first NUL
fn leading_string(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = &bytes[..end];
    if text.is_empty() || !text.iter().copied().all(printable) {
        return None;
    }
    let shown = &text[..text.len().min(STRING_PREVIEW)];
    let mut out = String::from_utf8_lossy(shown).into_owned();
    if text.len() > STRING_PREVIEW {
        out.push_str("...");
    }
    Some(out)
}

/// Printable runs of at least four bytes, joined by spaces
fn string_runs(bytes: &[u8]) -> String {
    let mut runs: Vec<String> = Vec::new();
    for run in bytes.split(|&b| !printable(b)) {
        if run.len() >= 4 {
            runs.push(String::from_utf8_lossy(run).into_owned());
        }
    }
    let mut joined = runs.join(" ");
    if joined.len() > STRING_PREVIEW {
        let mut cut = STRING_PREVIEW;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
        joined.push_str("...");
    }
    joined
}

fn result_text(header: &EventHeader) -> Option<String> {
    match header.category {
        Category::Signal => None,
        Category::Syscall => {
            let result = header.result;
            if result < 0 {
                let errno = errno_name(-result).unwrap_or("?");
                Some(format!("{result} ({errno})"))
            } else if result < HEX_THRESHOLD {
                Some(result.to_string())
            } else {
                Some(format!("{result:#x}"))
            }
        }
        Category::X11 | Category::DBus => Some(header.result.to_string()),
    }
}

fn extra_text(header: &EventHeader, payload: &Payload) -> Option<String> {
    match header.category {
        Category::Syscall => payload.iter().find_map(|section| match section {
            Section::Memory { bytes, .. } => leading_string(bytes).map(|s| format!("\"{s}\"")),
            _ => None,
        }),
        Category::Signal => payload.iter().find_map(|section| match section {
            Section::SignalInfo {
                code, fault_addr, ..
            } => Some(format!("code={code} addr={fault_addr:#x}")),
            _ => None,
        }),
        Category::DBus => payload.iter().find_map(|section| match section {
            Section::Message { bytes } => {
                let runs = string_runs(bytes);
                (!runs.is_empty()).then_some(runs)
            }
            _ => None,
        }),
        Category::X11 => payload.iter().find_map(|section| match section {
            Section::Message { bytes } => {
                let prefix = hex::encode(&bytes[..bytes.len().min(8)]);
                Some(format!("len={} {prefix}", bytes.len()))
            }
            _ => None,
        }),
    }
}

/// Render one event as a single display line
#[must_use]
pub fn describe(header: &EventHeader, payload: &Payload) -> String {
    let mut line = format!(
        "{:>8}: {:>16} ths={:>2} tid={:>5}",
        header.index,
        event_name(header.category, header.code),
        header.thread_count,
        header.thread_id
    );
    if let Some(result) = result_text(header) {
        let _ = write!(line, " result={result}");
    }
    if let Some(extra) = extra_text(header, payload) {
        let _ = write!(line, " {extra}");
    }
    line
}
