//! Time types for retrace.
//!
//! Events are ordered by a monotonic clock that starts at zero when a
//! recording starts. Wall-clock time is only kept as session metadata and
//! as the bridge used to place a crash dump on the trace timeline.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Monotonic nanoseconds since recording start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonoTime(u64);

impl MonoTime {
    /// Recording start
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw nanoseconds
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get raw nanoseconds
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Milliseconds as a float, for display
    #[must_use]
    pub fn as_millis_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Nanoseconds elapsed since `earlier`, zero if `earlier` is later
    #[must_use]
    pub const fn since(&self, earlier: MonoTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Absolute distance between two points
    #[must_use]
    pub const fn distance(&self, other: MonoTime) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl Default for MonoTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for MonoTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

impl From<u64> for MonoTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Wall clock timestamp in unix nanoseconds - metadata only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallTime(i64);

impl WallTime {
    /// Create from unix nanoseconds
    #[must_use]
    pub const fn from_unix_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Get unix nanoseconds
    #[must_use]
    pub const fn as_unix_nanos(&self) -> i64 {
        self.0
    }

    /// Current wall clock time
    #[must_use]
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self(now.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// Local time formatted like the task list (`YYYY/MM/DD hh:mm:ss.mmm`)
    #[must_use]
    pub fn to_display_string(&self) -> String {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        match chrono::DateTime::from_timestamp(secs, nanos) {
            Some(utc) => utc
                .with_timezone(&chrono::Local)
                .format("%Y/%m/%d %H:%M:%S%.3f")
                .to_string(),
            None => format!("{}ns", self.0),
        }
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Wall-clock nanoseconds at monotonic zero of one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockOffset(i64);

impl ClockOffset {
    /// Create from the wall time observed at recording start
    #[must_use]
    pub const fn from_wall(start: WallTime) -> Self {
        Self(start.as_unix_nanos())
    }

    /// Raw offset in unix nanoseconds
    #[must_use]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Map a wall time onto the monotonic timeline. Times before the
    /// recording started clamp to zero.
    #[must_use]
    pub fn to_mono(&self, wall: WallTime) -> MonoTime {
        let delta = wall.as_unix_nanos().saturating_sub(self.0);
        MonoTime::from_nanos(u64::try_from(delta).unwrap_or(0))
    }

    /// Map a monotonic time back to wall clock
    #[must_use]
    pub fn to_wall(&self, mono: MonoTime) -> WallTime {
        let nanos = i64::try_from(mono.as_nanos()).unwrap_or(i64::MAX);
        WallTime::from_unix_nanos(self.0.saturating_add(nanos))
    }
}

/// Monotonic clock anchored at recording start
#[derive(Debug, Clone, Copy)]
pub struct MonoClock {
    origin: Instant,
    offset: ClockOffset,
}

impl MonoClock {
    /// Start a clock now
    #[must_use]
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            offset: ClockOffset::from_wall(WallTime::now()),
        }
    }

    /// Current monotonic time
    #[must_use]
    pub fn now(&self) -> MonoTime {
        self.at(Instant::now())
    }

    /// Monotonic time of a previously captured instant
    #[must_use]
    pub fn at(&self, instant: Instant) -> MonoTime {
        let elapsed = instant.saturating_duration_since(self.origin);
        MonoTime::from_nanos(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Wall-clock anchor of this clock
    #[must_use]
    pub const fn offset(&self) -> ClockOffset {
        self.offset
    }
}
