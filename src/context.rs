//! Platform context — hosted `capture` / `resume`
//!
//! Every logical thread except the main one runs on a carrier OS thread
//! whose stack is the thread's stack. A context is a baton: `resume`
//! hands it over, `capture` parks the caller until its own baton comes
//! back. Only the baton holder executes, so exactly one logical thread
//! runs user code at any instant.
//!
//! Author: Moroya Sakamoto

use std::io;
use std::thread::{Builder, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Saved execution context of one logical thread
#[derive(Debug, Default)]
pub struct Context {
    /// Baton present: the owner may run
    baton: Mutex<bool>,
    wake: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend the calling OS thread until this context is resumed.
    ///
    /// A `resume` that arrives before the capture is not lost.
    pub fn capture(&self) {
        let mut baton = self.baton.lock();
        while !*baton {
            self.wake.wait(&mut baton);
        }
        *baton = false;
    }

    /// Transfer control to this context.
    pub fn resume(&self) {
        let mut baton = self.baton.lock();
        *baton = true;
        self.wake.notify_one();
    }
}

/// Latch released once when the scheduler runs out of work
#[derive(Debug, Default)]
pub(crate) struct IdleLatch {
    idle: Mutex<bool>,
    cond: Condvar,
}

impl IdleLatch {
    pub(crate) fn release(&self) {
        let mut idle = self.idle.lock();
        *idle = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut idle = self.idle.lock();
        while !*idle {
            self.cond.wait(&mut idle);
        }
    }
}

/// Start a carrier OS thread with a stack of `stack_size` bytes.
pub(crate) fn spawn_carrier<F>(name: String, stack_size: usize, entry: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().name(name).stack_size(stack_size).spawn(entry)
}
