//! Recording gate.
//!
//! Decides at capture time whether an observation is kept. With a trigger
//! configured nothing passes until the trigger function returns; with
//! "current thread only" set, only the originating thread passes. The gate
//! also keeps the live thread census shared by every producer.

use parking_lot::Mutex;
use retrace_core::MonoTime;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Gate state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    waiting_for_trigger: bool,
    opened_at: MonoTime,
    origin: Option<u32>,
    current_thread_only: bool,
    threads: BTreeSet<u32>,
}

/// Gate shared between the tracer thread and the preload listener
pub type SharedGate = Arc<Mutex<Gate>>;

impl Gate {
    /// Gate for a target whose initial thread is `initial_tid`
    #[must_use]
    pub fn new(initial_tid: u32, has_trigger: bool, current_thread_only: bool) -> Self {
        Self {
            waiting_for_trigger: has_trigger,
            opened_at: MonoTime::zero(),
            origin: (!has_trigger).then_some(initial_tid),
            current_thread_only,
            threads: BTreeSet::from([initial_tid]),
        }
    }

    /// Wrap for sharing
    #[must_use]
    pub fn shared(self) -> SharedGate {
        Arc::new(Mutex::new(self))
    }

    /// The trigger function returned on `tid`
    pub fn open(&mut self, tid: u32, at: MonoTime) {
        if !self.waiting_for_trigger {
            return;
        }
        self.waiting_for_trigger = false;
        self.opened_at = at;
        self.origin = Some(tid);
        info!(tid, at = %at, "Trigger returned, recording");
    }

    /// Whether the trigger has fired or none was set
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.waiting_for_trigger
    }

    /// Originating thread, once known
    #[must_use]
    pub fn origin(&self) -> Option<u32> {
        self.origin
    }

    /// Whether an observation by `tid` at `at` is kept
    #[must_use]
    pub fn admits(&self, tid: u32, at: MonoTime) -> bool {
        if self.waiting_for_trigger || at < self.opened_at {
            return false;
        }
        !self.current_thread_only || self.origin == Some(tid)
    }

    /// Record a new thread
    pub fn thread_started(&mut self, tid: u32) {
        self.threads.insert(tid);
    }

    /// Record a thread exit
    pub fn thread_exited(&mut self, tid: u32) {
        self.threads.remove(&tid);
    }

    /// Live threads, saturated to the header width
    #[must_use]
    pub fn thread_count(&self) -> u16 {
        u16::try_from(self.threads.len()).unwrap_or(u16::MAX)
    }
}
