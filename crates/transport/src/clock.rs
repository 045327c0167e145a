//! Wall-clock source shared by the coordination protocols.
//!
//! Key rotation compares epoch timestamps written by other processes
//! (`currentStart`, `prevExpire`, `endOfLockTime`), so every component reads
//! "now" through a [`Clock`]. Production code uses [`SystemClock`]; tests use
//! `TokioClock` (feature `testutil`) whose time advances with tokio's
//! pausable clock, keeping timestamps and timers in step.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time as whole seconds since the Unix epoch.
    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }

    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The operating system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns a shared [`SystemClock`].
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Returns how long to wait from `now` until the epoch-millisecond instant
/// `at_millis`. Instants in the past yield [`Duration::ZERO`].
#[must_use]
pub fn until_millis(clock: &dyn Clock, at_millis: i64) -> Duration {
    let delta = at_millis.saturating_sub(clock.now_millis());
    u64::try_from(delta).map(Duration::from_millis).unwrap_or(Duration::ZERO)
}
