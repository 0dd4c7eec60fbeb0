//! Snapshot iterators.
//!
//! The range end is fixed at creation, so events appended afterwards are
//! not visible. Iterators are restartable and stop after the first error.

use crate::error::{StoreError, StoreResult};
use crate::store::TraceStore;
use retrace_core::CancelToken;
use retrace_log::{CategoryMask, Event, EventHeader};

/// Shared cursor state of both iterators
#[derive(Debug, Clone)]
struct Span {
    start: u64,
    end: u64,
    next: u64,
    mask: CategoryMask,
    cancel: CancelToken,
}

impl Span {
    fn new(start: u64, end: u64, mask: CategoryMask) -> Self {
        Self {
            start,
            end,
            next: start,
            mask,
            cancel: CancelToken::never(),
        }
    }

    /// Next matching header, reading headers only
    fn advance(&mut self, store: &TraceStore) -> Option<StoreResult<crate::index::IndexEntry>> {
        while self.next < self.end {
            if self.cancel.is_cancelled() {
                self.next = self.end;
                return Some(Err(StoreError::Cancelled));
            }
            let index = self.next;
            self.next += 1;
            match store.read_entry(index) {
                Ok(entry) if self.mask.contains(entry.header.category) => return Some(Ok(entry)),
                Ok(_) => {}
                Err(e) => {
                    self.next = self.end;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Iterator over full events
#[derive(Debug, Clone)]
pub struct EventIter {
    store: TraceStore,
    span: Span,
}

impl EventIter {
    pub(crate) fn new(store: TraceStore, start: u64, end: u64, mask: CategoryMask) -> Self {
        Self {
            store,
            span: Span::new(start, end, mask),
        }
    }

    /// Builder method: stop with `Cancelled` once `token` fires
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.span.cancel = token;
        self
    }

    /// Start over from the beginning of the range
    pub fn restart(&mut self) {
        self.span.next = self.span.start;
    }

    /// Exclusive end of the snapshot
    #[must_use]
    pub fn snapshot_end(&self) -> u64 {
        self.span.end
    }
}

impl Iterator for EventIter {
    type Item = StoreResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.span.advance(&self.store)? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        match self.store.read_payload(&entry) {
            Ok(payload) => Some(Ok(Event::new(entry.header, payload))),
            Err(e) => {
                self.span.next = self.span.end;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.span.end.saturating_sub(self.span.next);
        (0, usize::try_from(left).ok())
    }
}

/// Iterator over event headers; never touches `payload.bin`
#[derive(Debug, Clone)]
pub struct HeaderIter {
    store: TraceStore,
    span: Span,
}

impl HeaderIter {
    pub(crate) fn new(store: TraceStore, start: u64, end: u64, mask: CategoryMask) -> Self {
        Self {
            store,
            span: Span::new(start, end, mask),
        }
    }

    /// Builder method: stop with `Cancelled` once `token` fires
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.span.cancel = token;
        self
    }

    /// Start over from the beginning of the range
    pub fn restart(&mut self) {
        self.span.next = self.span.start;
    }
}

impl Iterator for HeaderIter {
    type Item = StoreResult<EventHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        self.span
            .advance(&self.store)
            .map(|r| r.map(|entry| entry.header))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.span.end.saturating_sub(self.span.next);
        (0, usize::try_from(left).ok())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{CreateOptions, TraceStore};
    use crate::meta::SessionStatus;
    use proptest::prelude::*;
    use retrace_core::{CancelToken, MonoTime};
    use retrace_log::{Category, CategoryMask, Event, EventHeader};

    fn store_with(dir: &std::path::Path, categories: &[Category], stamps: &[u64]) -> TraceStore {
        let store = TraceStore::create(dir, CreateOptions::new("/bin/t", 1)).unwrap();
        for (i, (c, ts)) in categories.iter().zip(stamps).enumerate() {
            let header = EventHeader::new(i as u64, MonoTime::from_nanos(*ts), *c, 0);
            store.append(&Event::new(header, vec![i as u8; i % 5])).unwrap();
        }
        store
    }

    #[test]
    fn test_iter_mask_and_range() {
        let tmp = tempfile::tempdir().unwrap();
        let cats = [Category::Syscall, Category::Signal, Category::Syscall, Category::X11];
        let store = store_with(tmp.path(), &cats, &[1, 2, 3, 4]);

        let sys: Vec<_> = store
            .iter(.., CategoryMask::only(Category::Syscall))
            .map(|e| e.unwrap().header.index)
            .collect();
        assert_eq!(sys, vec![0, 2]);

        let ranged: Vec<_> = store
            .headers(1..=2, CategoryMask::ALL)
            .map(|h| h.unwrap().index)
            .collect();
        assert_eq!(ranged, vec![1, 2]);
        assert_eq!(store.iter(10..20, CategoryMask::ALL).count(), 0);
    }

    #[test]
    fn test_iter_is_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(tmp.path(), &[Category::Syscall; 3], &[1, 2, 3]);
        let mut iter = store.iter(.., CategoryMask::ALL);
        let header = EventHeader::new(3, MonoTime::from_nanos(9), Category::Syscall, 0);
        store.append(&Event::new(header, Vec::new())).unwrap();
        assert_eq!(iter.snapshot_end(), 3);
        assert_eq!(iter.by_ref().count(), 3);
        iter.restart();
        assert_eq!(iter.count(), 3);
        assert_eq!(store.iter(.., CategoryMask::ALL).count(), 4);
    }

    #[test]
    fn test_iter_twice_identical_on_complete_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(tmp.path(), &[Category::Signal; 6], &[1, 1, 2, 3, 5, 8]);
        store.finalize(SessionStatus::Complete).unwrap();
        let reopened = TraceStore::open(tmp.path()).unwrap();
        let a: Vec<_> = reopened.iter(.., CategoryMask::ALL).map(Result::unwrap).collect();
        let b: Vec<_> = reopened.iter(.., CategoryMask::ALL).map(Result::unwrap).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_headers_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(tmp.path(), &[Category::Syscall; 2], &[1, 2]);
        let token = CancelToken::new();
        let mut iter = store.headers(.., CategoryMask::ALL).with_cancel(token.clone());
        assert!(iter.next().unwrap().is_ok());
        token.cancel();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_iteration_ordered(deltas in proptest::collection::vec(0u64..1000, 1..60)) {
            let tmp = tempfile::tempdir().unwrap();
            let stamps: Vec<u64> = deltas.iter().scan(0u64, |acc, d| { *acc += d; Some(*acc) }).collect();
            let cats: Vec<Category> = (0..stamps.len()).map(|i| Category::ALL[i % 4]).collect();
            let store = store_with(tmp.path(), &cats, &stamps);

            let headers: Vec<_> = store.headers(.., CategoryMask::ALL).map(Result::unwrap).collect();
            prop_assert_eq!(headers.len(), stamps.len());
            for pair in headers.windows(2) {
                prop_assert!(pair[0].index < pair[1].index);
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
            for (i, h) in headers.iter().enumerate() {
                let event = store.read(i as u64).unwrap();
                prop_assert_eq!(&event.header, h);
                prop_assert_eq!(event.payload.len(), i % 5);
            }
        }
    }
}
