//! Cooperative scheduler core
//!
//! The dispatcher state machine. Owns the control blocks, the ready
//! queue and the single `current` slot. Every entry point mutates state
//! and returns a [`Handoff`] telling the caller where control goes next;
//! the transfer itself happens after the state lock is dropped.
//!
//! READY and NEW threads live only in the ready queue. The current
//! thread is removed from the queue while it runs and goes back only
//! through `yield_current` or by being woken from a join.
//!
//! Author: Moroya Sakamoto

use std::sync::Arc;

use crate::config::{QueueMode, SchedulerConfig};
use crate::context::Context;
use crate::error::{ThreadError, ThreadResult};
use crate::queue::ReadyQueue;
use crate::tcb::{ExitCode, Stack, StartRoutine, Tcb, TcbStore, ThreadId, ThreadPriority, ThreadStatus};
use crate::timer::SysTimer;

/// Where control goes after a scheduling event
pub(crate) enum Handoff {
    /// Caller keeps the processor
    Stay,
    /// Transfer to another thread
    Switch { to: ThreadId, context: Arc<Context> },
    /// Ready queue empty, nothing runs
    Idle,
}

/// Outcome of one join attempt
pub(crate) enum JoinStep {
    /// Target had exited; its control block is released
    Done(ExitCode, Tcb),
    /// Caller is blocked on the target
    Wait(Handoff),
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Threads successfully created, main included
    pub created: u64,
    /// Threads that reached EXITED
    pub exited: u64,
    /// Successful joins
    pub joined: u64,
    /// Control blocks released
    pub released: u64,
    /// Creates that failed after allocating a control block
    pub discarded: u64,
    /// Dispatch decisions
    pub dispatches: u64,
    /// Dispatches that changed the running thread
    pub context_switches: u64,
    /// Threads waiting in the ready queue
    pub ready: usize,
    /// Threads blocked in join
    pub blocked: usize,
    /// Live control blocks
    pub live: usize,
}

/// Scheduler state
pub struct SchedulerState {
    store: TcbStore,
    ready: ReadyQueue<ThreadId>,
    /// Running thread (None = idle or not started)
    current: Option<ThreadId>,
    /// Last thread dispatched
    last: Option<ThreadId>,
    mode: QueueMode,
    timer: SysTimer,
    idle: bool,
    exited: u64,
    joined: u64,
    dispatches: u64,
    context_switches: u64,
}

impl SchedulerState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            store: TcbStore::new(config.max_threads),
            ready: ReadyQueue::new(),
            current: None,
            last: None,
            mode: config.mode,
            timer: SysTimer::new(config.clock),
            idle: false,
            exited: 0,
            joined: 0,
            dispatches: 0,
            context_switches: 0,
        }
    }

    /// Register the calling OS thread as the running main thread
    pub(crate) fn register_main(&mut self, host: std::thread::ThreadId) -> ThreadResult<ThreadId> {
        let id = self.store.allocate(ThreadPriority::NORMAL, Some("main".into()))?;
        let now = self.timer.now_us();
        if let Some(tcb) = self.store.get_mut(id) {
            tcb.status = ThreadStatus::Running;
            tcb.host = Some(host);
            tcb.dispatched_at = now;
            tcb.dispatches = 1;
        }
        self.current = Some(id);
        self.last = Some(id);
        Ok(id)
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn store(&self) -> &TcbStore {
        &self.store
    }

    pub fn ready(&self) -> &ReadyQueue<ThreadId> {
        &self.ready
    }

    /// The running thread, provided `host` is the OS thread carrying it
    pub(crate) fn running_on(&self, host: std::thread::ThreadId) -> ThreadResult<ThreadId> {
        let id = self.current.ok_or(ThreadError::NotRunning)?;
        match self.store.get(id) {
            Some(tcb) if tcb.host == Some(host) => Ok(id),
            _ => Err(ThreadError::NotRunning),
        }
    }

    pub fn status(&self, id: ThreadId) -> ThreadResult<ThreadStatus> {
        self.store
            .get(id)
            .map(Tcb::status)
            .ok_or(ThreadError::InvalidHandle(id))
    }

    pub(crate) fn allocate(&mut self, priority: ThreadPriority, name: Option<String>) -> ThreadResult<ThreadId> {
        self.store.allocate(priority, name)
    }

    /// Attach entry point and stack to a fresh control block and queue it
    pub(crate) fn admit(&mut self, id: ThreadId, start: StartRoutine, stack: Option<Stack>) {
        let Some(tcb) = self.store.get_mut(id) else {
            return;
        };
        tcb.host = stack.as_ref().map(Stack::host);
        tcb.stack = stack;
        tcb.start = Some(start);
        log::debug!("thread {} created", tcb.label());
        self.make_ready(id);
    }

    /// Undo an allocation whose stack could not be set up
    pub(crate) fn discard(&mut self, id: ThreadId) {
        if self.store.discard(id).is_none() {
            log::warn!("thread {id}: discard of a dispatched control block ignored");
        }
    }

    pub(crate) fn context_of(&self, id: ThreadId) -> Option<Arc<Context>> {
        self.store.get(id).map(|tcb| tcb.context.clone())
    }

    /// Consume the entry point at first dispatch
    pub(crate) fn take_start(&mut self, id: ThreadId) -> Option<StartRoutine> {
        self.store.get_mut(id).and_then(|tcb| tcb.start.take())
    }

    fn make_ready(&mut self, id: ThreadId) {
        let queued = match self.mode {
            QueueMode::Fifo => self.ready.enqueue(id),
            QueueMode::Sorted(comp) => {
                let store = &self.store;
                self.ready.enqueue_sort(id, |a, b| match (store.get(*a), store.get(*b)) {
                    (Some(a), Some(b)) => comp(a, b),
                    _ => false,
                })
            }
        };
        debug_assert!(queued, "thread {id} queued twice");
    }

    /// Close the running slice of `id` and charge it
    fn charge(&mut self, id: ThreadId) {
        self.timer.end_slice();
        let timer = &self.timer;
        if let Some(tcb) = self.store.get_mut(id) {
            tcb.cpu_time_us += timer.elapsed_since(tcb.dispatched_at);
        }
    }

    /// Pick the next thread. Requires no current thread.
    pub(crate) fn dispatch(&mut self) -> Handoff {
        debug_assert!(self.current.is_none());
        loop {
            let Some(next) = self.ready.dequeue() else {
                self.current = None;
                self.idle = true;
                log::debug!("ready queue empty, scheduler idle");
                return Handoff::Idle;
            };
            let now = self.timer.now_us();
            let Some(tcb) = self.store.get_mut(next) else {
                log::error!("thread {next} was queued without a control block");
                continue;
            };
            debug_assert!(tcb.status.is_runnable(), "thread {next} queued while {:?}", tcb.status);
            if tcb.status == ThreadStatus::New {
                log::debug!("thread {} first dispatch", tcb.label());
            }
            tcb.status = ThreadStatus::Running;
            tcb.dispatched_at = now;
            tcb.dispatches += 1;
            let context = tcb.context.clone();

            self.current = Some(next);
            self.dispatches += 1;
            if self.last != Some(next) {
                self.context_switches += 1;
                self.last = Some(next);
            }
            log::trace!("dispatch -> thread {next}");
            return Handoff::Switch { to: next, context };
        }
    }

    /// Re-queue the current thread and dispatch
    pub(crate) fn yield_current(&mut self) -> ThreadResult<Handoff> {
        let me = self.current.ok_or(ThreadError::NotRunning)?;
        self.charge(me);
        if let Some(tcb) = self.store.get_mut(me) {
            tcb.status = ThreadStatus::Ready;
        }
        self.current = None;
        self.make_ready(me);

        Ok(match self.dispatch() {
            Handoff::Switch { to, .. } if to == me => Handoff::Stay,
            other => other,
        })
    }

    /// Mark the current thread EXITED, wake its joiner and dispatch
    pub(crate) fn exit_current(&mut self, code: ExitCode) -> ThreadResult<Handoff> {
        let me = self.current.ok_or(ThreadError::NotRunning)?;
        self.charge(me);
        self.current = None;

        let joiner = match self.store.get_mut(me) {
            Some(tcb) => {
                tcb.status = ThreadStatus::Exited;
                tcb.exit_code = Some(code);
                log::debug!("thread {} exited with {code}", tcb.label());
                tcb.joiner
            }
            None => None,
        };
        self.exited += 1;

        if let Some(joiner) = joiner {
            if let Some(tcb) = self.store.get_mut(joiner) {
                tcb.status = ThreadStatus::Ready;
                tcb.waiting_on = None;
            }
            self.make_ready(joiner);
        }
        Ok(self.dispatch())
    }

    /// Collect `target` if it has exited, otherwise block the current thread on it
    pub(crate) fn join_step(&mut self, target: ThreadId) -> ThreadResult<JoinStep> {
        let me = self.current.ok_or(ThreadError::NotRunning)?;
        if target == me {
            return Err(ThreadError::Deadlock(target));
        }
        let Some(tcb) = self.store.get(target) else {
            return Err(if self.store.was_allocated(target) {
                ThreadError::DoubleJoin(target)
            } else {
                ThreadError::InvalidHandle(target)
            });
        };
        if matches!(tcb.joiner, Some(other) if other != me) {
            return Err(ThreadError::DoubleJoin(target));
        }

        if tcb.status == ThreadStatus::Exited {
            let code = tcb.exit_code.ok_or(ThreadError::InvalidHandle(target))?;
            let released = self.store.release(target)?;
            self.joined += 1;
            log::debug!("thread {me} joined thread {target} (exit code {code})");
            return Ok(JoinStep::Done(code, released));
        }

        if self.closes_cycle(me, target) || self.ready.is_empty() {
            return Err(ThreadError::Deadlock(target));
        }

        self.charge(me);
        self.current = None;
        if let Some(tcb) = self.store.get_mut(target) {
            tcb.joiner = Some(me);
        }
        if let Some(tcb) = self.store.get_mut(me) {
            tcb.status = ThreadStatus::Blocked;
            tcb.waiting_on = Some(target);
        }
        log::trace!("thread {me} blocked on thread {target}");
        Ok(JoinStep::Wait(self.dispatch()))
    }

    /// Would `me` waiting on `target` close a chain of waiters back to `me`?
    fn closes_cycle(&self, me: ThreadId, target: ThreadId) -> bool {
        let mut cursor = self.store.get(target).and_then(|t| t.waiting_on);
        // Chains are acyclic, the bound only guards against corruption
        for _ in 0..=self.store.live() {
            match cursor {
                Some(id) if id == me => return true,
                Some(id) => cursor = self.store.get(id).and_then(|t| t.waiting_on),
                None => return false,
            }
        }
        true
    }

    /// Release every exited control block nobody joined
    pub(crate) fn teardown(&mut self) -> Vec<Tcb> {
        let exited: Vec<ThreadId> = self
            .store
            .iter()
            .filter(|t| t.status() == ThreadStatus::Exited)
            .map(Tcb::id)
            .collect();
        for tcb in self.store.iter().filter(|t| t.status() != ThreadStatus::Exited) {
            log::warn!("thread {} still {:?} at teardown", tcb.label(), tcb.status());
        }
        exited
            .into_iter()
            .filter_map(|id| self.store.release(id).ok())
            .collect()
    }

    /// Drop every remaining control block without running it.
    ///
    /// Used when the last user handle goes away before `shutdown`.
    pub(crate) fn abandon(&mut self) -> Vec<Tcb> {
        self.ready = ReadyQueue::new();
        self.current = None;
        self.idle = true;
        let ids: Vec<ThreadId> = self.store.iter().map(Tcb::id).collect();
        ids.into_iter().filter_map(|id| self.store.evict(id)).collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            created: self.store.allocated() - self.store.discarded(),
            exited: self.exited,
            joined: self.joined,
            released: self.store.released(),
            discarded: self.store.discarded(),
            dispatches: self.dispatches,
            context_switches: self.context_switches,
            ready: self.ready.len(),
            blocked: self
                .store
                .iter()
                .filter(|t| t.status() == ThreadStatus::Blocked)
                .count(),
            live: self.store.live(),
        }
    }
}
