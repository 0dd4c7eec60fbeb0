//! Restricted views.
//!
//! A view is the list of trace indices a filter or query selected, in
//! display order. It never copies events; rows are read from the store on
//! demand.

use crate::error::{ReplayError, ReplayResult};
use crate::query::Query;
use retrace_core::CancelToken;
use retrace_log::{CategoryMask, EventHeader};
use retrace_store::{OrderKey, TraceStore, sort_headers};
use std::sync::Arc;
use tracing::debug;

/// Selected indices over one store
#[derive(Debug, Clone)]
pub struct View {
    store: TraceStore,
    indices: Arc<[u64]>,
    order: OrderKey,
    descending: bool,
}

impl View {
    pub(crate) fn new(store: TraceStore, indices: Arc<[u64]>) -> Self {
        Self {
            store,
            indices,
            order: OrderKey::Index,
            descending: false,
        }
    }

    pub(crate) fn sorted(store: TraceStore, indices: Arc<[u64]>, key: OrderKey, descending: bool) -> Self {
        Self {
            order: key,
            descending,
            ..Self::new(store, indices)
        }
    }

    /// Events of the categories in `mask`, in trace order
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn by_category(
        store: &TraceStore,
        mask: CategoryMask,
        cancel: &CancelToken,
    ) -> ReplayResult<Self> {
        let indices = store
            .headers(.., mask)
            .with_cancel(cancel.clone())
            .map(|h| h.map(|h| h.index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(store.clone(), indices.into()))
    }

    /// Events selected by `query`, in trace order
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn by_query(store: &TraceStore, query: &Query, cancel: &CancelToken) -> ReplayResult<Self> {
        let mut indices = Vec::new();
        for header in store
            .headers(query.bounds(store.len()), query.mask())
            .with_cancel(cancel.clone())
        {
            let header = header?;
            if query.matches(&header) {
                indices.push(header.index);
            }
        }
        debug!(%query, matches = indices.len(), "Query view");
        Ok(Self::new(store.clone(), indices.into()))
    }

    /// Rows in display order
    #[must_use]
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether nothing was selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Trace index of row `row`
    #[must_use]
    pub fn get(&self, row: usize) -> Option<u64> {
        self.indices.get(row).copied()
    }

    /// Current sort key and direction
    #[must_use]
    pub fn order(&self) -> (OrderKey, bool) {
        (self.order, self.descending)
    }

    /// Re-sort rows by `key`; ties stay in trace order
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn reorder(&mut self, key: OrderKey, descending: bool, cancel: &CancelToken) -> ReplayResult<()> {
        let mut headers = self.headers(cancel)?;
        sort_headers(&mut headers, key, descending);
        self.indices = headers.iter().map(|h| h.index).collect();
        self.order = key;
        self.descending = descending;
        Ok(())
    }

    /// Headers of every row, in display order
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn headers(&self, cancel: &CancelToken) -> ReplayResult<Vec<EventHeader>> {
        let mut headers = Vec::with_capacity(self.indices.len());
        for &index in self.indices.iter() {
            if cancel.is_cancelled() {
                return Err(ReplayError::Cancelled);
            }
            headers.push(self.store.read_header(index)?);
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::MonoTime;
    use retrace_log::{Category, Event};
    use retrace_store::CreateOptions;

    fn store(dir: &std::path::Path) -> TraceStore {
        let store = TraceStore::create(dir, CreateOptions::new("/bin/t", 1)).unwrap();
        // (category, code, duration, result, threads)
        let rows = [
            (Category::Syscall, 0, 30, 10, 1),
            (Category::Signal, 11, 0, 0, 2),
            (Category::Syscall, 1, 10, -2, 3),
            (Category::DBus, 1, 50, 0, 1),
            (Category::Syscall, 0, 20, 5, 2),
        ];
        for (i, (category, code, duration, result, threads)) in rows.into_iter().enumerate() {
            let header = EventHeader::new(i as u64, MonoTime::from_nanos(i as u64), category, code)
                .with_thread(7, threads)
                .with_outcome(duration, result);
            store.append(&Event::new(header, Vec::new())).unwrap();
        }
        store
    }

    #[test]
    fn test_by_category() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let view = View::by_category(&store, CategoryMask::only(Category::Syscall), &CancelToken::never()).unwrap();
        assert_eq!(view.indices(), &[0, 2, 4]);
        assert_eq!(view.get(1), Some(2));
        assert_eq!(view.get(3), None);
    }

    #[test]
    fn test_by_query() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let never = CancelToken::never();
        let sys = View::by_query(&store, &Query::parse("sys 0 ret > 0").unwrap(), &never).unwrap();
        assert_eq!(sys.indices(), &[0, 4]);
        let list = View::by_query(&store, &Query::parse("list 1,3").unwrap(), &never).unwrap();
        assert_eq!(list.indices(), &[1, 2, 3]);
    }

    #[test]
    fn test_reorder() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let never = CancelToken::never();
        let mut view = View::by_category(&store, CategoryMask::ALL, &never).unwrap();

        view.reorder(OrderKey::Duration, true, &never).unwrap();
        assert_eq!(view.indices(), &[3, 0, 4, 2, 1]);
        view.reorder(OrderKey::Result, false, &never).unwrap();
        assert_eq!(view.indices(), &[2, 1, 3, 4, 0]);
        view.reorder(OrderKey::ThreadCount, false, &never).unwrap();
        assert_eq!(view.indices(), &[0, 3, 1, 4, 2]);
        assert_eq!(view.order(), (OrderKey::ThreadCount, false));
    }
}
