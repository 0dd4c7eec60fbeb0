//! Predicate seek.
//!
//! Predicates that are monotonic over the trace (false up to some index,
//! true from there on) are answered by binary search over headers. All
//! others scan linearly. Either way the number of predicate evaluations is
//! reported.

use crate::error::{ReplayError, ReplayResult};
use regex::bytes::Regex;
use retrace_core::{CancelToken, MonoTime};
use retrace_log::{CategoryMask, Direction, Event, EventHeader, Payload};
use retrace_store::TraceStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `==`
    Eq,
    /// `>=`
    Ge,
    /// `>`
    Gt,
}

impl CmpOp {
    /// Parse an operator symbol
    #[must_use]
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "==" => Some(Self::Eq),
            ">=" => Some(Self::Ge),
            ">" => Some(Self::Gt),
            _ => None,
        }
    }

    /// Operator symbol
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ge => ">=",
            Self::Gt => ">",
        }
    }

    /// `lhs OP rhs`
    #[must_use]
    pub fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Caller-supplied event test
pub type EventFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// What to seek for
#[derive(Clone)]
pub enum Predicate {
    /// First event at or after a time
    TimestampAtLeast(MonoTime),
    /// First event at or after an index
    IndexAtLeast(u64),
    /// Event in one of these categories
    Category(CategoryMask),
    /// Event from this thread
    Thread(u32),
    /// Result compared against a value
    Result(CmpOp, i64),
    /// Any captured buffer matches
    PayloadRegex(Regex),
    /// Arbitrary test on the full event
    Custom(EventFn),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimestampAtLeast(t) => write!(f, "timestamp >= {t}"),
            Self::IndexAtLeast(i) => write!(f, "index >= {i}"),
            Self::Category(mask) => write!(f, "category in {:#06b}", mask.bits()),
            Self::Thread(tid) => write!(f, "tid == {tid}"),
            Self::Result(op, value) => write!(f, "result {op} {value}"),
            Self::PayloadRegex(re) => write!(f, "payload =~ /{}/", re.as_str()),
            Self::Custom(_) => f.write_str("custom"),
        }
    }
}

impl Predicate {
    /// Wrap a closure
    pub fn custom(f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Whether binary search applies
    #[must_use]
    pub const fn is_monotonic(&self) -> bool {
        matches!(self, Self::TimestampAtLeast(_) | Self::IndexAtLeast(_))
    }

    const fn needs_payload(&self) -> bool {
        matches!(self, Self::PayloadRegex(_) | Self::Custom(_))
    }

    /// Test a header; `None` if the payload is needed
    #[must_use]
    pub fn test_header(&self, header: &EventHeader) -> Option<bool> {
        Some(match self {
            Self::TimestampAtLeast(t) => header.timestamp >= *t,
            Self::IndexAtLeast(i) => header.index >= *i,
            Self::Category(mask) => mask.contains(header.category),
            Self::Thread(tid) => header.thread_id == *tid,
            Self::Result(op, value) => op.holds(header.result, *value),
            Self::PayloadRegex(_) | Self::Custom(_) => return None,
        })
    }

    /// Test a full event
    #[must_use]
    pub fn test(&self, event: &Event) -> bool {
        match self {
            Self::PayloadRegex(re) => match Payload::decode(&event.payload) {
                Ok(payload) => payload
                    .iter()
                    .filter_map(|s| s.bytes())
                    .any(|bytes| re.is_match(bytes)),
                Err(_) => re.is_match(&event.payload),
            },
            Self::Custom(f) => f(event),
            other => other.test_header(&event.header).unwrap_or(false),
        }
    }
}

/// Where a seek landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeekOutcome {
    /// First matching index in the search direction
    pub index: Option<u64>,
    /// Predicate evaluations made
    pub comparisons: u64,
}

fn evaluate(store: &TraceStore, predicate: &Predicate, index: u64) -> ReplayResult<bool> {
    if predicate.needs_payload() {
        Ok(predicate.test(&store.read(index)?))
    } else {
        Ok(predicate.test_header(&store.read_header(index)?).unwrap_or(false))
    }
}

/// Seek from `from` in `direction`; `from` itself is a candidate
///
/// # Errors
///
/// Returns `Cancelled` or any read error
pub fn seek(
    store: &TraceStore,
    predicate: &Predicate,
    from: u64,
    direction: Direction,
    cancel: &CancelToken,
) -> ReplayResult<SeekOutcome> {
    let len = store.len();
    if from >= len {
        return Ok(SeekOutcome {
            index: None,
            comparisons: 0,
        });
    }
    let outcome = match (predicate.is_monotonic(), direction) {
        (true, Direction::Forward) => lower_bound(store, predicate, from, len, cancel)?,
        // monotonic: if `from` fails, everything before it fails too
        (true, Direction::Backward) => SeekOutcome {
            index: evaluate(store, predicate, from)?.then_some(from),
            comparisons: 1,
        },
        (false, Direction::Forward) => scan(store, predicate, from..len, cancel)?,
        (false, Direction::Backward) => scan(store, predicate, (0..=from).rev(), cancel)?,
    };
    debug!(?predicate, from, ?direction, index = ?outcome.index, comparisons = outcome.comparisons, "Seek");
    Ok(outcome)
}

fn lower_bound(
    store: &TraceStore,
    predicate: &Predicate,
    mut lo: u64,
    len: u64,
    cancel: &CancelToken,
) -> ReplayResult<SeekOutcome> {
    let mut hi = len;
    let mut comparisons = 0;
    while lo < hi {
        if cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        let mid = lo + (hi - lo) / 2;
        comparisons += 1;
        if evaluate(store, predicate, mid)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(SeekOutcome {
        index: (lo < len).then_some(lo),
        comparisons,
    })
}

fn scan(
    store: &TraceStore,
    predicate: &Predicate,
    indices: impl Iterator<Item = u64>,
    cancel: &CancelToken,
) -> ReplayResult<SeekOutcome> {
    let mut comparisons = 0;
    for index in indices {
        if cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        comparisons += 1;
        if evaluate(store, predicate, index)? {
            return Ok(SeekOutcome {
                index: Some(index),
                comparisons,
            });
        }
    }
    Ok(SeekOutcome {
        index: None,
        comparisons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_log::{Category, Section};
    use retrace_store::CreateOptions;

    fn store(dir: &std::path::Path, n: u64) -> TraceStore {
        let store = TraceStore::create(dir, CreateOptions::new("/bin/t", 1)).unwrap();
        for i in 0..n {
            let category = if i % 10 == 9 { Category::Signal } else { Category::Syscall };
            let header = EventHeader::new(i, MonoTime::from_nanos(i * 100), category, 0)
                .with_thread(1 + (i % 3) as u32, 3)
                .with_outcome(0, i as i64 - 500);
            let payload = if i == 777 {
                Payload::from(vec![Section::Memory {
                    addr: 0x1000,
                    bytes: b"/etc/passwd".to_vec(),
                }])
            } else {
                Payload::new()
            };
            store.append(&Event::with_sections(header, &payload).unwrap()).unwrap();
        }
        store
    }

    #[test]
    fn test_timestamp_seek_is_logarithmic() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 1000);
        let predicate = Predicate::TimestampAtLeast(MonoTime::from_nanos(42_050));
        let outcome = seek(&store, &predicate, 0, Direction::Forward, &CancelToken::never()).unwrap();
        assert_eq!(outcome.index, Some(421));
        assert!(outcome.comparisons <= 10, "{} comparisons", outcome.comparisons);
    }

    #[test]
    fn test_timestamp_past_end() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 100);
        let predicate = Predicate::TimestampAtLeast(MonoTime::from_nanos(1_000_000));
        let outcome = seek(&store, &predicate, 0, Direction::Forward, &CancelToken::never()).unwrap();
        assert_eq!(outcome.index, None);
    }

    #[test]
    fn test_index_seek() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 100);
        let outcome = seek(
            &store,
            &Predicate::IndexAtLeast(64),
            10,
            Direction::Forward,
            &CancelToken::never(),
        )
        .unwrap();
        assert_eq!(outcome.index, Some(64));
    }

    #[test]
    fn test_linear_category_and_backward() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 100);
        let signals = Predicate::Category(CategoryMask::only(Category::Signal));
        let never = CancelToken::never();

        let fwd = seek(&store, &signals, 20, Direction::Forward, &never).unwrap();
        assert_eq!(fwd, SeekOutcome { index: Some(29), comparisons: 10 });
        let back = seek(&store, &signals, 20, Direction::Backward, &never).unwrap();
        assert_eq!(back.index, Some(19));
    }

    #[test]
    fn test_result_and_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 600);
        let never = CancelToken::never();
        let ge = seek(&store, &Predicate::Result(CmpOp::Ge, 0), 0, Direction::Forward, &never).unwrap();
        assert_eq!(ge.index, Some(500));
        let tid = seek(&store, &Predicate::Thread(3), 0, Direction::Forward, &never).unwrap();
        assert_eq!(tid.index, Some(2));
    }

    #[test]
    fn test_payload_regex_and_custom() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 1000);
        let never = CancelToken::never();
        let re = Predicate::PayloadRegex(Regex::new("passwd").unwrap());
        assert_eq!(seek(&store, &re, 0, Direction::Forward, &never).unwrap().index, Some(777));

        let odd = Predicate::custom(|e| e.header.index % 2 == 1);
        assert_eq!(seek(&store, &odd, 10, Direction::Forward, &never).unwrap().index, Some(11));
    }

    #[test]
    fn test_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path(), 50);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = seek(&store, &Predicate::Thread(99), 0, Direction::Forward, &cancel).unwrap_err();
        assert_eq!(err, ReplayError::Cancelled);
    }

    #[test]
    fn test_cmp_op() {
        assert!(CmpOp::parse("<=").unwrap().holds(3, 3));
        assert!(!CmpOp::Gt.holds(3, 3));
        assert!(CmpOp::parse("=>").is_none());
    }
}
