//! Replay controller.
//!
//! The controller is the read side of a session: a cursor for stepping
//! through events, state reconstruction at any index, seeks and restricted
//! views. Clones share the store, the checkpoint cache and any merged
//! minidump; only the cursor is per clone.

use crate::checkpoint::{CHECKPOINT_INTERVAL, Checkpoints};
use crate::describe::describe;
use crate::error::{ReplayError, ReplayResult};
use crate::postmortem::Postmortem;
use crate::query::Query;
use crate::seek::{Predicate, SeekOutcome, seek};
use crate::state::{ReconstructedState, fold};
use crate::view::View;
use retrace_core::CancelToken;
use retrace_log::{CategoryMask, Cursor, Direction, Event, Payload};
use retrace_store::{OrderKey, StoreError, TraceStore};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read-only navigator over one recorded session
#[derive(Debug, Clone)]
pub struct ReplayController {
    store: TraceStore,
    checkpoints: Arc<Checkpoints>,
    postmortem: Option<Arc<Postmortem>>,
    cursor: Cursor,
}

impl ReplayController {
    /// Open the session directory at `path`
    ///
    /// A minidump stored with the session is merged in when it loads; a
    /// broken one is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be opened
    pub fn open(path: impl AsRef<Path>) -> ReplayResult<Self> {
        let store = TraceStore::open(path.as_ref())?;
        let mut controller = Self::from_store(store);
        if let Some(dump_path) = controller.store.minidump_path() {
            match Postmortem::load(&dump_path, &controller.store) {
                Ok(postmortem) => controller.postmortem = Some(Arc::new(postmortem)),
                Err(e) => warn!(path = %dump_path.display(), error = %e, "Skipping session minidump"),
            }
        }
        info!(
            session = %controller.store.session_id(),
            events = controller.len(),
            status = ?controller.store.status(),
            "Opened session for replay"
        );
        Ok(controller)
    }

    /// Controller over an already open store
    #[must_use]
    pub fn from_store(store: TraceStore) -> Self {
        let cursor = Cursor::new(store.len());
        Self {
            store,
            checkpoints: Arc::new(Checkpoints::new(CHECKPOINT_INTERVAL)),
            postmortem: None,
            cursor,
        }
    }

    /// Use a different checkpoint spacing
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoints = Arc::new(Checkpoints::new(interval));
        self
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    /// Shared checkpoint cache
    #[must_use]
    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    /// Committed events
    #[must_use]
    pub fn len(&self) -> u64 {
        self.store.len()
    }

    /// Whether the trace has no events
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Cursor position; `None` before the first step
    #[must_use]
    pub fn position(&self) -> Option<u64> {
        self.cursor.pos()
    }

    /// Pick up events committed since the last look, for live sessions
    ///
    /// # Errors
    ///
    /// Returns error if the index cannot be read
    pub fn refresh(&mut self) -> ReplayResult<u64> {
        let len = self.store.refresh()?;
        self.cursor.grow(len);
        Ok(len)
    }

    fn read_at(&self, index: Option<u64>) -> ReplayResult<Option<Event>> {
        index.map(|i| self.store.read(i)).transpose().map_err(Into::into)
    }

    /// Step to the next event
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be read
    pub fn next(&mut self) -> ReplayResult<Option<Event>> {
        self.cursor.grow(self.store.len());
        let index = self.cursor.step_forward();
        self.read_at(index)
    }

    /// Step to the previous event
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be read
    pub fn previous(&mut self) -> ReplayResult<Option<Event>> {
        let index = self.cursor.step_backward();
        self.read_at(index)
    }

    /// Move the cursor to `index`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when `index` is past the end
    pub fn goto(&mut self, index: u64) -> ReplayResult<Event> {
        self.cursor.grow(self.store.len());
        if !self.cursor.seek(index) {
            return Err(StoreError::NotFound {
                index,
                len: self.cursor.len(),
            }
            .into());
        }
        Ok(self.store.read(index)?)
    }

    /// State implied by every event up to and including `index`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` past the end, `Cancelled`, or any read error
    pub fn state_at(&self, index: u64, cancel: &CancelToken) -> ReplayResult<ReconstructedState> {
        let len = self.store.len();
        if index >= len {
            return Err(StoreError::NotFound { index, len }.into());
        }
        let (start, checkpoint) = self.checkpoints.nearest(&self.store, index, cancel)?;
        let mut state = (*checkpoint).clone();
        fold(&self.store, &mut state, start..index + 1, cancel)?;
        if let Some(postmortem) = &self.postmortem {
            if postmortem.visible_at(index) {
                state.crash = Some(postmortem.crash_record());
            }
        }
        debug!(index, from_checkpoint = start, "Reconstructed state");
        Ok(state)
    }

    /// State at the cursor; empty before the first step
    ///
    /// # Errors
    ///
    /// Same as [`Self::state_at`]
    pub fn current_state(&self, cancel: &CancelToken) -> ReplayResult<ReconstructedState> {
        match self.cursor.pos() {
            Some(index) => self.state_at(index, cancel),
            None => Ok(ReconstructedState::new()),
        }
    }

    /// First event matching `predicate`
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn seek(&self, predicate: &Predicate, cancel: &CancelToken) -> ReplayResult<Option<u64>> {
        Ok(seek(&self.store, predicate, 0, Direction::Forward, cancel)?.index)
    }

    /// Seek from `from` in `direction`, reporting the comparisons made
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn seek_from(
        &self,
        predicate: &Predicate,
        from: u64,
        direction: Direction,
        cancel: &CancelToken,
    ) -> ReplayResult<SeekOutcome> {
        seek(&self.store, predicate, from, direction, cancel)
    }

    /// Events of the categories in `mask`
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn filter_by_category(&self, mask: CategoryMask, cancel: &CancelToken) -> ReplayResult<View> {
        View::by_category(&self.store, mask, cancel)
    }

    /// Events selected by a parsed query
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn query(&self, query: &Query, cancel: &CancelToken) -> ReplayResult<View> {
        View::by_query(&self.store, query, cancel)
    }

    /// Parse `text` and run it
    ///
    /// # Errors
    ///
    /// Returns `Query` for malformed text, otherwise as [`Self::query`]
    pub fn query_str(&self, text: &str, cancel: &CancelToken) -> ReplayResult<View> {
        let query = Query::parse(text)?;
        self.query(&query, cancel)
    }

    /// Events of `mask` sorted by `key`; the ordering is cached by the store
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn ordered(
        &self,
        mask: CategoryMask,
        key: OrderKey,
        descending: bool,
        cancel: &CancelToken,
    ) -> ReplayResult<View> {
        let indices = self.store.ordered(.., mask, key, descending, cancel)?;
        Ok(View::sorted(self.store.clone(), indices, key, descending))
    }

    /// One-line summary of event `index`
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, a read error, or `Payload`
    pub fn describe(&self, index: u64) -> ReplayResult<String> {
        let event = self.store.read(index)?;
        let payload = Payload::decode(&event.payload).map_err(|e| ReplayError::Payload {
            index,
            reason: e.to_string(),
        })?;
        Ok(describe(&event.header, &payload))
    }

    /// Merge the minidump at `path`; replaces any earlier one
    ///
    /// # Errors
    ///
    /// Returns a format error or a trace read error
    pub fn attach_minidump(&mut self, path: impl AsRef<Path>) -> ReplayResult<&Postmortem> {
        let postmortem = Arc::new(Postmortem::load(path.as_ref(), &self.store)?);
        let postmortem = self.postmortem.insert(postmortem);
        Ok(&**postmortem)
    }

    /// Merged minidump, if any
    #[must_use]
    pub fn postmortem(&self) -> Option<&Postmortem> {
        self.postmortem.as_deref()
    }
}
