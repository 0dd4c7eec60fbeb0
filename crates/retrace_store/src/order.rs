//! Derived orderings.
//!
//! Sorting a range by duration, result or thread count reads every header
//! in the range once. The sorted index list is cached per query and never
//! written back to the trace. The cache holds at most
//! [`ORDER_CACHE_CAPACITY`] orderings; the oldest is evicted first, so a
//! live session whose range grows with every commit cannot grow it without
//! bound.

use crate::error::{StoreError, StoreResult};
use crate::store::TraceStore;
use parking_lot::Mutex;
use retrace_core::CancelToken;
use retrace_log::{CategoryMask, EventHeader};
use serde::{Deserialize, Serialize};
use indexmap::IndexMap;
use std::ops::RangeBounds;
use std::sync::Arc;
use tracing::debug;

/// Sort key for a derived ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    /// Trace order
    Index,
    /// Time to resolve
    Duration,
    /// Return value
    Result,
    /// Live thread count
    ThreadCount,
}

impl OrderKey {
    /// Sort value of `header` under this key
    #[must_use]
    pub fn value(self, header: &EventHeader) -> i128 {
        match self {
            Self::Index => i128::from(header.index),
            Self::Duration => i128::from(header.duration),
            Self::Result => i128::from(header.result),
            Self::ThreadCount => i128::from(header.thread_count),
        }
    }

    /// Parse `index`, `duration`, `result` or `threads`
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "index" => Some(Self::Index),
            "duration" => Some(Self::Duration),
            "result" => Some(Self::Result),
            "threads" | "thread_count" => Some(Self::ThreadCount),
            _ => None,
        }
    }
}

/// One cacheable ordering request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderQuery {
    /// First index, inclusive
    pub start: u64,
    /// Last index, exclusive
    pub end: u64,
    /// Categories included
    pub mask: CategoryMask,
    /// Sort key
    pub key: OrderKey,
    /// Largest first
    pub descending: bool,
}

/// Sort `headers` by `key`; ties keep trace order
pub fn sort_headers(headers: &mut [EventHeader], key: OrderKey, descending: bool) {
    headers.sort_by(|a, b| {
        let ord = key.value(a).cmp(&key.value(b));
        let ord = if descending { ord.reverse() } else { ord };
        ord.then(a.index.cmp(&b.index))
    });
}

/// Orderings kept per store
pub const ORDER_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub(crate) struct OrderCache {
    entries: Mutex<IndexMap<OrderQuery, Arc<[u64]>>>,
}

impl OrderCache {
    fn get(&self, query: &OrderQuery) -> Option<Arc<[u64]>> {
        self.entries.lock().get(query).cloned()
    }

    fn insert(&self, query: OrderQuery, order: Arc<[u64]>) {
        let mut entries = self.entries.lock();
        if entries.len() >= ORDER_CACHE_CAPACITY && !entries.contains_key(&query) {
            entries.shift_remove_index(0);
        }
        entries.insert(query, order);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl TraceStore {
    /// Indices in `range` matching `mask`, sorted by `key`
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires, or any read error
    pub fn ordered(
        &self,
        range: impl RangeBounds<u64>,
        mask: CategoryMask,
        key: OrderKey,
        descending: bool,
        cancel: &CancelToken,
    ) -> StoreResult<Arc<[u64]>> {
        let (start, end) = self.resolve_range(range);
        let query = OrderQuery {
            start,
            end,
            mask,
            key,
            descending,
        };
        if let Some(hit) = self.orders().get(&query) {
            return Ok(hit);
        }

        let mut headers = self
            .headers(start..end, mask)
            .with_cancel(cancel.clone())
            .collect::<StoreResult<Vec<_>>>()?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        sort_headers(&mut headers, key, descending);
        let order: Arc<[u64]> = headers.iter().map(|h| h.index).collect();

        debug!(start, end, ?key, descending, len = order.len(), "Cached derived ordering");
        self.orders().insert(query, Arc::clone(&order));
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CreateOptions;
    use retrace_core::MonoTime;
    use retrace_log::{Category, Event};

    fn store(dir: &std::path::Path) -> TraceStore {
        let store = TraceStore::create(dir, CreateOptions::new("/bin/t", 1)).unwrap();
        let rows = [(30, -2, 1), (10, 5, 3), (20, 0, 2), (10, 7, 1)];
        for (i, (duration, result, threads)) in rows.into_iter().enumerate() {
            let header = EventHeader::new(i as u64, MonoTime::from_nanos(i as u64), Category::Syscall, 0)
                .with_thread(1, threads)
                .with_outcome(duration, result);
            store.append(&Event::new(header, Vec::new())).unwrap();
        }
        store
    }

    #[test]
    fn test_order_by_duration_ties_keep_trace_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let order = store
            .ordered(.., CategoryMask::ALL, OrderKey::Duration, false, &CancelToken::never())
            .unwrap();
        assert_eq!(&*order, &[1, 3, 2, 0]);
    }

    #[test]
    fn test_order_descending_result_and_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let never = CancelToken::never();
        let by_result = store.ordered(.., CategoryMask::ALL, OrderKey::Result, true, &never).unwrap();
        assert_eq!(&*by_result, &[3, 1, 2, 0]);
        let by_threads = store
            .ordered(.., CategoryMask::ALL, OrderKey::ThreadCount, true, &never)
            .unwrap();
        assert_eq!(&*by_threads, &[1, 2, 0, 3]);
    }

    #[test]
    fn test_order_cached_and_index_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let never = CancelToken::never();
        let a = store.ordered(0..4, CategoryMask::ALL, OrderKey::Duration, false, &never).unwrap();
        let b = store.ordered(0..4, CategoryMask::ALL, OrderKey::Duration, false, &never).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.read_header(0).unwrap().index, 0);
    }

    #[test]
    fn test_order_cache_bounded_on_live_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let never = CancelToken::never();
        for i in 4..(4 + ORDER_CACHE_CAPACITY as u64 + 10) {
            let header = EventHeader::new(i, MonoTime::from_nanos(i), Category::Syscall, 0)
                .with_thread(1, 1)
                .with_outcome(i, 0);
            store.append(&Event::new(header, Vec::new())).unwrap();
            let order = store.ordered(.., CategoryMask::ALL, OrderKey::Duration, false, &never).unwrap();
            assert_eq!(order.len() as u64, i + 1);
        }
        assert_eq!(store.orders().len(), ORDER_CACHE_CAPACITY);
    }

    #[test]
    fn test_order_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            store.ordered(.., CategoryMask::ALL, OrderKey::Index, false, &token),
            Err(StoreError::Cancelled)
        ));
    }

    #[test]
    fn test_key_parse() {
        assert_eq!(OrderKey::parse("threads"), Some(OrderKey::ThreadCount));
        assert_eq!(OrderKey::parse("nope"), None);
    }
}
