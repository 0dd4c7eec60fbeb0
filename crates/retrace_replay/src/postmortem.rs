//! Minidumps merged into a replay.

use crate::error::ReplayResult;
use crate::state::CrashRecord;
use retrace_dump::{Correlation, Minidump, correlate, load};
use retrace_store::TraceStore;
use std::path::Path;
use tracing::{info, warn};

/// A minidump placed on a trace's timeline
#[derive(Debug, Clone)]
pub struct Postmortem {
    dump: Minidump,
    correlation: Correlation,
}

impl Postmortem {
    /// Load the dump at `path` and correlate it with `store`
    ///
    /// # Errors
    ///
    /// Returns a format error or a trace read error
    pub fn load(path: &Path, store: &TraceStore) -> ReplayResult<Self> {
        let dump = load(path)?;
        Self::from_dump(dump, store)
    }

    /// Correlate an already parsed dump
    ///
    /// # Errors
    ///
    /// Returns a trace read error
    pub fn from_dump(dump: Minidump, store: &TraceStore) -> ReplayResult<Self> {
        let correlation = correlate(&dump, store)?;
        for warning in &correlation.warnings {
            warn!("{warning}");
        }
        info!(
            index = ?correlation.index,
            distance_ns = correlation.distance_ns,
            "Crash placed at approximate position"
        );
        Ok(Self { dump, correlation })
    }

    /// The parsed dump
    #[must_use]
    pub fn dump(&self) -> &Minidump {
        &self.dump
    }

    /// Where the crash landed
    #[must_use]
    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    /// Approximate trace position of the crash
    #[must_use]
    pub fn index(&self) -> Option<u64> {
        self.correlation.index
    }

    /// Whether the crash belongs in the state at `index`
    #[must_use]
    pub fn visible_at(&self, index: u64) -> bool {
        self.correlation.index.is_some_and(|crash| index >= crash)
    }

    /// Crash details for the reconstructed state
    #[must_use]
    pub fn crash_record(&self) -> CrashRecord {
        let registers = self
            .dump
            .fault_thread()
            .map(|t| t.registers.clone())
            .unwrap_or_default();
        CrashRecord {
            index: self.correlation.index,
            crash_time: self.dump.crash_time,
            fault_tid: self.dump.fault_tid,
            signal: self.dump.signal,
            fault_addr: self.dump.fault_addr,
            registers,
            modules: self.dump.modules.clone(),
        }
    }
}
