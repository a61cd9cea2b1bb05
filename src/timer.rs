//! CPU clock — tick source for per-thread CPU accounting
//!
//! The scheduler charges each thread the time between its dispatch and
//! the moment it gives up the processor. On hosted targets this wraps a
//! monotonic clock. For testing, uses a software counter that advances
//! one quantum per scheduling slice, which keeps cpu-time ordering
//! deterministic.
//!
//! Author: Moroya Sakamoto

use std::time::Instant;

/// Software clock advance per scheduling slice (microseconds)
pub const SOFTWARE_SLICE_US: u64 = 1;

/// Where the clock reads time from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// `std::time::Instant`
    Monotonic,
    /// Counter advanced by the scheduler only
    Software,
}

/// System timer
pub struct SysTimer {
    source: ClockSource,
    /// Software tick count (microseconds)
    ticks_us: u64,
    /// Monotonic origin
    origin: Instant,
}

impl SysTimer {
    /// Create a timer for the given source
    pub fn new(source: ClockSource) -> Self {
        Self {
            source,
            ticks_us: 0,
            origin: Instant::now(),
        }
    }

    /// Advance software time by microseconds (no-op on a monotonic clock)
    pub fn advance(&mut self, us: u64) {
        if self.source == ClockSource::Software {
            self.ticks_us = self.ticks_us.saturating_add(us);
        }
    }

    /// Close a scheduling slice. Software clocks move one quantum.
    pub fn end_slice(&mut self) {
        self.advance(SOFTWARE_SLICE_US);
    }

    /// Current time in microseconds
    pub fn now_us(&self) -> u64 {
        match self.source {
            ClockSource::Software => self.ticks_us,
            ClockSource::Monotonic => {
                u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
            }
        }
    }

    /// Elapsed microseconds since a reference point
    pub fn elapsed_since(&self, reference: u64) -> u64 {
        self.now_us().saturating_sub(reference)
    }
}
