//! uthread — cooperative user-level threads
//!
//! Green threads that switch only when they say so.
//!
//! Minimal threading library for cooperative multitasking:
//! - Thread control blocks in an id-indexed arena (ids never reused)
//! - Ready queue with FIFO and comparator-ordered insertion
//! - Dispatcher with create / yield / join / exit semantics
//! - One logical thread runs at a time, no preemption, no locks in user code
//!
//! ```no_run
//! use uthread::{Scheduler, SchedulerConfig};
//!
//! let sched = Scheduler::init(SchedulerConfig::default()).unwrap();
//! let worker = sched
//!     .create(|s, n: i32| {
//!         for _ in 0..3 {
//!             s.yield_now().unwrap();
//!         }
//!         n
//!     }, 7)
//!     .unwrap();
//! assert_eq!(sched.join(worker).unwrap(), 7);
//! sched.shutdown(0).unwrap();
//! ```
//!
//! Author: Moroya Sakamoto

pub mod config;
pub mod context;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod tcb;
pub mod thread;
pub mod timer;

pub use config::{by_cpu_time, by_priority, Comparator, QueueMode, SchedulerConfig};
pub use context::Context;
pub use error::{ThreadError, ThreadResult};
pub use queue::ReadyQueue;
pub use scheduler::{SchedulerState, SchedulerStats};
pub use tcb::{ExitCode, Tcb, TcbStore, ThreadId, ThreadPriority, ThreadStatus};
pub use thread::{IdleReport, Scheduler, ThreadAttr, ThreadHandle, PANIC_EXIT_CODE};
pub use timer::{ClockSource, SysTimer};
