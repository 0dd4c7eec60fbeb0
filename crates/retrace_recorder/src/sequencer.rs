//! Commit ordering.
//!
//! Producers hand over events in roughly timestamp order. The sequencer
//! holds each one for a short window so that stragglers from another
//! producer can slot in, then releases them sorted by timestamp. An event
//! that arrives after something later was already committed is clamped to
//! the last committed timestamp. Indexes are assigned on release.

use retrace_core::MonoTime;
use retrace_log::{Category, Event, EventHeader};
use std::collections::BTreeMap;
use tracing::debug;

/// A captured event waiting for its index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    /// Event kind
    pub category: Category,
    /// Category-specific code
    pub code: u32,
    /// Originating thread
    pub tid: u32,
    /// Live traced threads
    pub thread_count: u16,
    /// Completion time
    pub timestamp: MonoTime,
    /// Nanoseconds to resolve
    pub duration: u64,
    /// Return or status code
    pub result: i64,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl Captured {
    /// Assign an index
    #[must_use]
    pub fn into_event(self, index: u64) -> Event {
        let header = EventHeader::new(index, self.timestamp, self.category, self.code)
            .with_thread(self.tid, self.thread_count)
            .with_outcome(self.duration, self.result);
        Event::new(header, self.payload)
    }
}

/// Reorder buffer
#[derive(Debug)]
pub struct Sequencer {
    window: u64,
    pending: BTreeMap<(MonoTime, u64), Captured>,
    arrivals: u64,
    next_index: u64,
    last_committed: MonoTime,
    clamped: u64,
}

impl Sequencer {
    /// Sequencer holding events for `window_ns`, numbering from `first_index`
    #[must_use]
    pub fn new(window_ns: u64, first_index: u64) -> Self {
        Self {
            window: window_ns,
            pending: BTreeMap::new(),
            arrivals: 0,
            next_index: first_index,
            last_committed: MonoTime::zero(),
            clamped: 0,
        }
    }

    /// Accept an event
    pub fn push(&mut self, captured: Captured) {
        self.arrivals += 1;
        self.pending.insert((captured.timestamp, self.arrivals), captured);
    }

    /// Events held back
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Next index to assign
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Events whose timestamp had to be raised
    #[must_use]
    pub fn clamped(&self) -> u64 {
        self.clamped
    }

    /// Release every event older than `now` minus the window
    pub fn drain_ready(&mut self, now: MonoTime) -> Vec<Event> {
        let horizon = now.as_nanos().saturating_sub(self.window);
        let mut out = Vec::new();
        while self
            .pending
            .first_key_value()
            .is_some_and(|((ts, _), _)| ts.as_nanos() <= horizon)
        {
            if let Some((_, captured)) = self.pending.pop_first() {
                out.push(self.commit(captured));
            }
        }
        out
    }

    /// Release everything
    pub fn flush(&mut self) -> Vec<Event> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some((_, captured)) = self.pending.pop_first() {
            out.push(self.commit(captured));
        }
        out
    }

    fn commit(&mut self, mut captured: Captured) -> Event {
        if captured.timestamp < self.last_committed {
            debug!(
                behind_ns = self.last_committed.since(captured.timestamp),
                category = %captured.category,
                "Clamping late event"
            );
            captured.timestamp = self.last_committed;
            self.clamped += 1;
        }
        self.last_committed = captured.timestamp;
        let index = self.next_index;
        self.next_index += 1;
        captured.into_event(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn captured(ts: u64, code: u32) -> Captured {
        Captured {
            category: Category::Syscall,
            code,
            tid: 1,
            thread_count: 1,
            timestamp: MonoTime::from_nanos(ts),
            duration: 0,
            result: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_reorders_within_window() {
        let mut seq = Sequencer::new(100, 0);
        seq.push(captured(50, 1));
        seq.push(captured(30, 2));
        seq.push(captured(40, 3));
        assert!(seq.drain_ready(MonoTime::from_nanos(120)).is_empty());

        let out = seq.drain_ready(MonoTime::from_nanos(160));
        let codes: Vec<_> = out.iter().map(|e| e.header.code).collect();
        assert_eq!(codes, vec![2, 3, 1]);
        assert_eq!(out.iter().map(Event::index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut seq = Sequencer::new(0, 0);
        for code in 0..5 {
            seq.push(captured(10, code));
        }
        let codes: Vec<_> = seq.flush().iter().map(|e| e.header.code).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_straggler_is_clamped() {
        let mut seq = Sequencer::new(10, 5);
        seq.push(captured(100, 1));
        assert_eq!(seq.drain_ready(MonoTime::from_nanos(200)).len(), 1);
        seq.push(captured(90, 2));
        let out = seq.flush();
        assert_eq!(out[0].timestamp(), MonoTime::from_nanos(100));
        assert_eq!(out[0].index(), 6);
        assert_eq!(seq.clamped(), 1);
        assert_eq!(seq.next_index(), 7);
    }

    proptest! {
        #[test]
        fn prop_output_is_gap_free_and_ordered(
            stamps in proptest::collection::vec(0u64..10_000, 1..200),
            window in 0u64..500,
        ) {
            let mut seq = Sequencer::new(window, 0);
            let mut out = Vec::new();
            for (i, ts) in stamps.iter().enumerate() {
                seq.push(captured(*ts, i as u32));
                out.extend(seq.drain_ready(MonoTime::from_nanos(*ts)));
            }
            out.extend(seq.flush());
            prop_assert_eq!(out.len(), stamps.len());
            for (i, pair) in out.windows(2).enumerate() {
                prop_assert_eq!(pair[0].index(), i as u64);
                prop_assert!(pair[0].timestamp() <= pair[1].timestamp());
            }
        }
    }
}
