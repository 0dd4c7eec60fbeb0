//! Lazily built state checkpoints.
//!
//! Checkpoint `k` is the fold of events `[0, k * interval)`. They are built
//! on demand, each from the previous one, and shared by every clone of a
//! controller.

use crate::error::ReplayResult;
use crate::state::{ReconstructedState, fold};
use parking_lot::Mutex;
use retrace_core::CancelToken;
use retrace_store::TraceStore;
use std::sync::Arc;
use tracing::debug;

/// Events between checkpoints
pub const CHECKPOINT_INTERVAL: u64 = 256;

/// Checkpoint cache for one trace
#[derive(Debug)]
pub struct Checkpoints {
    interval: u64,
    states: Mutex<Vec<Arc<ReconstructedState>>>,
}

impl Default for Checkpoints {
    fn default() -> Self {
        Self::new(CHECKPOINT_INTERVAL)
    }
}

impl Checkpoints {
    /// Cache with a checkpoint every `interval` events
    #[must_use]
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            states: Mutex::new(vec![Arc::new(ReconstructedState::new())]),
        }
    }

    /// Spacing between checkpoints
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Checkpoints built so far, including the empty one
    #[must_use]
    pub fn built(&self) -> usize {
        self.states.lock().len()
    }

    /// Latest checkpoint at or before event `index`, with the first index it
    /// does not cover. Missing checkpoints up to there are built first.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn nearest(
        &self,
        store: &TraceStore,
        index: u64,
        cancel: &CancelToken,
    ) -> ReplayResult<(u64, Arc<ReconstructedState>)> {
        let wanted = usize::try_from(index / self.interval).unwrap_or(usize::MAX);
        loop {
            let (have, last) = {
                let states = self.states.lock();
                let have = states.len() - 1;
                if have >= wanted {
                    return Ok((wanted as u64 * self.interval, Arc::clone(&states[wanted])));
                }
                (have, Arc::clone(&states[have]))
            };
            // built without the lock held; a racing builder may win the push
            let start = have as u64 * self.interval;
            let mut next = (*last).clone();
            fold(store, &mut next, start..start + self.interval, cancel)?;
            let mut states = self.states.lock();
            if states.len() == have + 1 {
                debug!(checkpoint = have + 1, upto = start + self.interval, "Built checkpoint");
                states.push(Arc::new(next));
            }
        }
    }

    /// Drop every checkpoint but the empty one
    pub fn clear(&self) {
        self.states.lock().truncate(1);
    }
}
