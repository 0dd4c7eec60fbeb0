//! Crash-to-trace correlation.

use crate::error::DumpResult;
use crate::format::Minidump;
use retrace_core::MonoTime;
use retrace_store::TraceStore;
use serde::Serialize;
use tracing::{debug, warn};

/// Where a crash lands on a trace timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correlation {
    /// Nearest event, `None` for an empty trace
    pub index: Option<u64>,
    /// Crash time on the trace's monotonic clock
    pub crash_mono: MonoTime,
    /// Distance between the crash and the chosen event
    pub distance_ns: u64,
    /// Non-fatal findings, e.g. a session id mismatch
    pub warnings: Vec<String>,
}

/// Index of the event closest to `target` among `len` events with
/// non-decreasing timestamps.
///
/// Smallest absolute distance wins, ties go to the earlier index. A target
/// before the first event maps to 0, after the last to `len - 1`.
///
/// # Errors
///
/// Propagates errors from `timestamp_at`
pub fn nearest_index<F, E>(len: u64, target: MonoTime, mut timestamp_at: F) -> Result<Option<u64>, E>
where
    F: FnMut(u64) -> Result<MonoTime, E>,
{
    if len == 0 {
        return Ok(None);
    }
    // first index whose timestamp is >= target
    let (mut lo, mut hi) = (0u64, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if timestamp_at(mid)? < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == 0 {
        return Ok(Some(0));
    }
    if lo == len {
        return Ok(Some(len - 1));
    }
    let before = target.distance(timestamp_at(lo - 1)?);
    let after = target.distance(timestamp_at(lo)?);
    Ok(Some(if before <= after { lo - 1 } else { lo }))
}

/// Place a crash on a session's timeline
///
/// # Errors
///
/// Returns error if a trace header cannot be read
pub fn correlate(dump: &Minidump, store: &TraceStore) -> DumpResult<Correlation> {
    let meta = store.meta();
    let mut warnings = Vec::new();
    if dump.session_id != meta.session_id {
        let warning = format!(
            "minidump belongs to session {}, trace is {}",
            dump.session_id, meta.session_id
        );
        warn!("{warning}");
        warnings.push(warning);
    }

    let crash_mono = meta.clock_offset.to_mono(dump.crash_time);
    let len = store.len();
    let index = nearest_index(len, crash_mono, |i| {
        store.read_header(i).map(|h| h.timestamp)
    })?;

    let distance_ns = match index {
        Some(i) => crash_mono.distance(store.read_header(i)?.timestamp),
        None => 0,
    };
    debug!(?index, crash = %crash_mono, distance_ns, "Correlated minidump");

    Ok(Correlation {
        index,
        crash_mono,
        distance_ns,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::{ClockOffset, SessionId, WallTime};
    use retrace_log::{Category, Event, EventHeader};
    use retrace_store::CreateOptions;
    use std::convert::Infallible;

    fn nearest(ts: &[u64], target: u64) -> Option<u64> {
        nearest_index::<_, Infallible>(ts.len() as u64, MonoTime::from_nanos(target), |i| {
            Ok(MonoTime::from_nanos(ts[i as usize]))
        })
        .unwrap()
    }

    #[test]
    fn test_nearest_rule() {
        let ts = [100, 200, 300, 300, 500];
        assert_eq!(nearest(&ts, 0), Some(0));
        assert_eq!(nearest(&ts, 100), Some(0));
        assert_eq!(nearest(&ts, 149), Some(0));
        assert_eq!(nearest(&ts, 150), Some(0));
        assert_eq!(nearest(&ts, 151), Some(1));
        assert_eq!(nearest(&ts, 300), Some(2));
        assert_eq!(nearest(&ts, 420), Some(4));
        assert_eq!(nearest(&ts, 10_000), Some(4));
        assert_eq!(nearest(&[], 10), None);
    }

    fn session(dir: &std::path::Path, id: SessionId, start: i64, n: u64) -> TraceStore {
        let mut opts = CreateOptions::new("/bin/demo", 1).with_session_id(id);
        opts.clock_offset = ClockOffset::from_wall(WallTime::from_unix_nanos(start));
        let store = TraceStore::create(dir, opts).unwrap();
        for i in 0..n {
            let header =
                EventHeader::new(i, MonoTime::from_nanos(i * 1_000), Category::Syscall, 0);
            store.append(&Event::new(header, Vec::new())).unwrap();
        }
        store
    }

    #[test]
    fn test_crash_between_events() {
        let tmp = tempfile::tempdir().unwrap();
        let start = 1_700_000_000_000_000_000;
        let id = SessionId::new();
        let store = session(tmp.path(), id, start, 100);

        // event 42 at 42_000ns, event 43 at 43_000ns
        for (offset, expected) in [(42_300, 42), (42_500, 42), (42_501, 43), (42_900, 43)] {
            let dump = Minidump::new(id, WallTime::from_unix_nanos(start + offset), 1, 11);
            let c = correlate(&dump, &store).unwrap();
            assert_eq!(c.index, Some(expected), "crash at +{offset}");
            assert!(c.warnings.is_empty());
        }
    }

    #[test]
    fn test_crash_outside_trace_clamps() {
        let tmp = tempfile::tempdir().unwrap();
        let start = 1_700_000_000_000_000_000;
        let id = SessionId::new();
        let store = session(tmp.path(), id, start, 10);

        let early = Minidump::new(id, WallTime::from_unix_nanos(start - 5_000), 1, 11);
        let c = correlate(&early, &store).unwrap();
        assert_eq!(c.index, Some(0));
        assert_eq!(c.crash_mono, MonoTime::zero());

        let late = Minidump::new(id, WallTime::from_unix_nanos(start + 1_000_000), 1, 11);
        let c = correlate(&late, &store).unwrap();
        assert_eq!(c.index, Some(9));
        assert_eq!(c.distance_ns, 1_000_000 - 9_000);
    }

    #[test]
    fn test_empty_trace_and_session_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = session(tmp.path(), SessionId::new(), 0, 0);
        let dump = Minidump::new(SessionId::new(), WallTime::from_unix_nanos(50), 1, 6);
        let c = correlate(&dump, &store).unwrap();
        assert_eq!(c.index, None);
        assert_eq!(c.warnings.len(), 1);
    }
}
