//! Scheduler configuration
//!
//! Queue discipline, stack sizing, thread capacity and the CPU clock.
//! `from_env` lets a deployment override the defaults without a rebuild.
//!
//! Author: Moroya Sakamoto

use std::env;
use std::fmt;

use crate::error::{ThreadError, ThreadResult};
use crate::tcb::Tcb;
use crate::timer::ClockSource;

/// Default carrier stack size (256 KiB)
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack a thread may be created with (16 KiB)
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default maximum number of live threads, main included
pub const DEFAULT_MAX_THREADS: usize = 1024;

/// Ordering predicate for sorted mode: "a ranks at or before b".
///
/// Must be a total preorder for the ready queue to stay sorted.
pub type Comparator = fn(&Tcb, &Tcb) -> bool;

/// Higher priority (lower number) first
pub fn by_priority(a: &Tcb, b: &Tcb) -> bool {
    a.priority() <= b.priority()
}

/// Least accumulated CPU time first
pub fn by_cpu_time(a: &Tcb, b: &Tcb) -> bool {
    a.cpu_time_us() <= b.cpu_time_us()
}

/// Ready-queue discipline
#[derive(Clone, Copy)]
pub enum QueueMode {
    /// Run in the order threads became ready
    Fifo,
    /// Insert by comparator
    Sorted(Comparator),
}

impl QueueMode {
    pub fn priority() -> Self {
        QueueMode::Sorted(by_priority)
    }

    pub fn cpu_time() -> Self {
        QueueMode::Sorted(by_cpu_time)
    }

    /// Parse `fifo`, `priority` or `cputime`
    pub fn parse(s: &str) -> ThreadResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(QueueMode::Fifo),
            "priority" => Ok(QueueMode::priority()),
            "cputime" | "cpu-time" | "cpu_time" => Ok(QueueMode::cpu_time()),
            other => Err(ThreadError::InvalidArgument(format!("unknown queue mode '{other}'"))),
        }
    }

    pub fn is_sorted(&self) -> bool {
        matches!(self, QueueMode::Sorted(_))
    }
}

impl fmt::Debug for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Fifo => f.write_str("Fifo"),
            QueueMode::Sorted(_) => f.write_str("Sorted"),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: QueueMode,
    /// Stack size for threads that do not set their own
    pub stack_size: usize,
    /// Maximum live threads, main included
    pub max_threads: usize,
    /// CPU clock used for accounting
    pub clock: ClockSource,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Fifo,
            stack_size: DEFAULT_STACK_SIZE,
            max_threads: DEFAULT_MAX_THREADS,
            clock: ClockSource::Monotonic,
        }
    }
}

impl SchedulerConfig {
    /// Configuration for testing (software clock, small stacks)
    pub fn testing() -> Self {
        Self {
            stack_size: 64 * 1024,
            clock: ClockSource::Software,
            ..Self::default()
        }
    }

    /// Defaults overridden by `UTHREAD_MODE`, `UTHREAD_STACK_SIZE`
    /// and `UTHREAD_MAX_THREADS`
    pub fn from_env() -> ThreadResult<Self> {
        let mut config = Self::default();
        if let Ok(mode) = env::var("UTHREAD_MODE") {
            config.mode = QueueMode::parse(&mode)?;
        }
        if let Some(size) = env_usize("UTHREAD_STACK_SIZE")? {
            config.stack_size = size;
        }
        if let Some(max) = env_usize("UTHREAD_MAX_THREADS")? {
            config.max_threads = max;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> ThreadResult<()> {
        check_stack_size(self.stack_size)?;
        // Room for the main thread plus at least one more
        if self.max_threads < 2 {
            return Err(ThreadError::InvalidArgument(format!(
                "max_threads must be at least 2, got {}",
                self.max_threads
            )));
        }
        Ok(())
    }
}

pub(crate) fn check_stack_size(size: usize) -> ThreadResult<()> {
    if size < MIN_STACK_SIZE {
        return Err(ThreadError::InvalidArgument(format!(
            "stack size {size} below minimum {MIN_STACK_SIZE}"
        )));
    }
    Ok(())
}

fn env_usize(key: &str) -> ThreadResult<Option<usize>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ThreadError::InvalidArgument(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
