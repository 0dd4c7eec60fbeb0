//! Terminal rendering of sessions, states and dumps.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use retrace_dump::{Correlation, Minidump};
use retrace_log::{Category, signal_name};
use retrace_replay::ReconstructedState;
use retrace_store::{SessionStatus, SessionSummary};
use std::fmt::Write;
use std::time::Duration;

/// Bytes shown per hex dump before eliding
const HEX_LIMIT: usize = 64;

/// Spinner on stderr with a steady tick
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn paint_status(status: SessionStatus, text: String) -> String {
    match status {
        SessionStatus::Complete => style(text).green().to_string(),
        SessionStatus::Crashed => style(text).red().bold().to_string(),
        SessionStatus::Corrupt => style(text).yellow().to_string(),
        SessionStatus::Recording => style(text).cyan().to_string(),
    }
}

/// Colored status word
pub fn status(status: SessionStatus) -> String {
    paint_status(status, status.to_string())
}

/// Hex of at most [`HEX_LIMIT`] bytes
pub fn hex_preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(HEX_LIMIT)];
    let mut out = hex::encode(shown);
    if bytes.len() > HEX_LIMIT {
        let _ = write!(out, "... ({} bytes)", bytes.len());
    }
    out
}

fn session_name(summary: &SessionSummary) -> String {
    summary
        .dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| summary.dir.display().to_string())
}

/// One row per session
pub fn session_table(sessions: &[SessionSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<32} {:<10} {:<23} {:>9}  {}",
        "SESSION", "STATUS", "STARTED", "EVENTS", "TARGET"
    );
    for s in sessions {
        // padded before styling, escape codes would skew the width
        let status_cell = paint_status(s.meta.status, format!("{:<10}", s.meta.status.to_string()));
        let _ = writeln!(
            out,
            "{:<32} {} {:<23} {:>9}  {}",
            session_name(s),
            status_cell,
            s.meta.start_time.to_display_string(),
            s.event_count,
            s.meta.target_path
        );
    }
    out
}

/// Multi-line session summary
pub fn summary(s: &SessionSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", style("session").bold(), s.meta.session_id);
    let _ = writeln!(out, "  dir        {}", s.dir.display());
    let _ = writeln!(out, "  status     {}", status(s.meta.status));
    let _ = writeln!(out, "  target     {} (pid {})", s.meta.target_path, s.meta.process_id);
    let _ = writeln!(out, "  started    {}", s.meta.start_time);
    if let Some(end) = s.meta.end_time {
        let _ = writeln!(out, "  ended      {end}");
    }
    let _ = writeln!(
        out,
        "  events     {} over {:.3}ms",
        s.event_count,
        s.span_nanos() as f64 / 1_000_000.0
    );
    for category in Category::ALL {
        let _ = writeln!(out, "    {:<8} {}", category.name(), s.count(category));
    }
    let _ = writeln!(out, "  minidump   {}", if s.has_minidump { "yes" } else { "no" });
    if let Some(at) = s.meta.truncated_at {
        let _ = writeln!(out, "  truncated  at event {at}");
    }
    for warning in &s.warnings {
        let _ = writeln!(out, "  {} {warning}", style("warning:").yellow());
    }
    out
}

/// Reconstructed state, one section per kind
pub fn state(state: &ReconstructedState) -> String {
    let mut out = String::new();
    match state.position {
        Some(index) => {
            let at = state.timestamp.map(|t| t.to_string()).unwrap_or_default();
            let _ = writeln!(out, "{} at event {index} ({at})", style("state").bold());
        }
        None => {
            let _ = writeln!(out, "{} before the first event", style("state").bold());
        }
    }
    let threads: Vec<String> = state.threads.iter().map(ToString::to_string).collect();
    let _ = writeln!(out, "  threads    [{}]", threads.join(", "));
    for (name, value) in &state.globals {
        let _ = writeln!(
            out,
            "  global     {name} @ {:#x} = {} (event {})",
            value.addr,
            hex_preview(&value.bytes),
            value.index
        );
    }
    if let Some(stack) = &state.stack {
        let _ = writeln!(
            out,
            "  stack      tid {} sp {:#x} = {} (event {})",
            stack.tid,
            stack.sp,
            hex_preview(&stack.bytes),
            stack.index
        );
    }
    if let Some(heap) = &state.heap {
        let _ = writeln!(
            out,
            "  heap       @ {:#x} = {} (event {})",
            heap.addr,
            hex_preview(&heap.bytes),
            heap.index
        );
    }
    for (tid, registers) in &state.registers {
        let _ = writeln!(out, "  registers  tid {tid}: {} bytes", registers.len());
    }
    if let Some(crash) = &state.crash {
        let signal = signal_name(crash.signal).unwrap_or("?");
        let _ = writeln!(
            out,
            "  {}      {signal} in tid {} at {:#x}, {}",
            style("crash").red().bold(),
            crash.fault_tid,
            crash.fault_addr,
            crash.crash_time
        );
        for module in &crash.modules {
            let _ = writeln!(out, "    {:#014x} {:>10}  {}", module.base, module.size, module.path);
        }
    }
    out
}

/// Minidump contents
pub fn minidump(dump: &Minidump) -> String {
    let mut out = String::new();
    let signal = signal_name(dump.signal).unwrap_or("?");
    let _ = writeln!(out, "{} for session {}", style("minidump").bold(), dump.session_id);
    let _ = writeln!(out, "  crashed    {}", dump.crash_time);
    let _ = writeln!(
        out,
        "  signal     {} ({signal}) in tid {} at {:#x}",
        dump.signal, dump.fault_tid, dump.fault_addr
    );
    let _ = writeln!(
        out,
        "  system     {} x{} {}",
        dump.system.arch, dump.system.cpu_count, dump.system.uname
    );
    for thread in &dump.threads {
        let marker = if thread.tid == dump.fault_tid { "*" } else { " " };
        let _ = writeln!(
            out,
            "  {marker}thread    {} stack {:#x} ({} bytes), {} register bytes",
            thread.tid,
            thread.stack_start,
            thread.stack.len(),
            thread.registers.len()
        );
    }
    for module in &dump.modules {
        let _ = writeln!(out, "  module     {:#014x} {:>10}  {}", module.base, module.size, module.path);
    }
    for range in &dump.memory {
        let _ = writeln!(out, "  memory     {:#x} {} bytes", range.start, range.bytes.len());
    }
    out
}

/// Where a crash landed on the timeline
pub fn correlation(c: &Correlation) -> String {
    let mut out = String::new();
    match c.index {
        Some(index) => {
            let _ = writeln!(
                out,
                "approximate position: event {index} ({}ns from crash at {})",
                c.distance_ns, c.crash_mono
            );
        }
        None => {
            let _ = writeln!(out, "no position: the trace is empty");
        }
    }
    for warning in &c.warnings {
        let _ = writeln!(out, "{} {warning}", style("warning:").yellow());
    }
    out
}
