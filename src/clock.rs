//! Monotonic microsecond clock shared by the acquisition path.
//!
//! All real-time timestamps in the rig are microseconds on a single monotonic
//! timeline anchored at clock construction. The capture thread, the sync
//! tracker, and the mock camera all read the same [`MonoClock`] so that
//! camera timestamps, stimulus timestamps and staleness checks are directly
//! comparable. Tests substitute a [`ManualClock`] to drive time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic microsecond timestamps.
#[derive(Clone)]
pub enum Clock {
    /// Wall-rate monotonic clock (process-relative).
    Mono(MonoClock),
    /// Test clock advanced by hand.
    Manual(ManualClock),
}

impl Clock {
    /// Create the production clock, anchored at "now".
    pub fn monotonic() -> Self {
        Clock::Mono(MonoClock::new())
    }

    /// Create a manual clock starting at `start_us`.
    pub fn manual(start_us: u64) -> Self {
        Clock::Manual(ManualClock::new(start_us))
    }

    /// Current time in microseconds since the clock's origin.
    pub fn now_us(&self) -> u64 {
        match self {
            Clock::Mono(c) => c.now_us(),
            Clock::Manual(c) => c.now_us(),
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Clock::Mono(_) => write!(f, "Clock::Mono({} us)", self.now_us()),
            Clock::Manual(_) => write!(f, "Clock::Manual({} us)", self.now_us()),
        }
    }
}

/// Monotonic clock based on [`Instant`], reported as microseconds since
/// construction.
#[derive(Clone)]
pub struct MonoClock {
    origin: Instant,
}

impl MonoClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared hand-advanced clock for tests.
#[derive(Clone)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }

    /// Advance the clock by `delta_us`.
    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::AcqRel);
    }

    /// Jump to an absolute time. Only moves forward.
    pub fn set_us(&self, t_us: u64) {
        let mut cur = self.now_us.load(Ordering::Acquire);
        while t_us > cur {
            match self.now_us.compare_exchange(
                cur,
                t_us,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }
}
