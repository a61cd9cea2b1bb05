//! Thread API — init, create, yield, join, exit
//!
//! [`Scheduler`] is the handle every call goes through; routines receive
//! it as their first argument, so there is no process-wide state and
//! independent schedulers can coexist.
//!
//! Each call locks the scheduler state, lets the core decide, drops the
//! lock and only then transfers control. A thread that never yields,
//! joins or exits keeps the processor for as long as it likes.
//!
//! Author: Moroya Sakamoto

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{check_stack_size, SchedulerConfig};
use crate::context::{spawn_carrier, Context, IdleLatch};
use crate::error::{ThreadError, ThreadResult};
use crate::scheduler::{Handoff, JoinStep, SchedulerState, SchedulerStats};
use crate::tcb::{ExitCode, Stack, Tcb, ThreadId, ThreadPriority, ThreadStatus};

/// Exit code of a thread whose routine panicked
pub const PANIC_EXIT_CODE: ExitCode = -1;

/// Source of per-scheduler tags stamped into handles
static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Set while this OS thread carries a logical thread of some scheduler
    static ATTACHED: Cell<bool> = const { Cell::new(false) };
}

/// Unwind payload used by `exit` to leave the routine
struct ExitRequest(ExitCode);

/// Unwind payload ending a suspended thread whose scheduler was dropped
struct Abandoned;

/// Handle to a created thread, consumed by `join`.
///
/// Only valid with the scheduler that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    sched: u64,
    id: ThreadId,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.id
    }
}

/// Per-thread creation attributes
#[derive(Debug, Clone, Default)]
pub struct ThreadAttr {
    name: Option<String>,
    priority: ThreadPriority,
    stack_size: Option<usize>,
}

impl ThreadAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Stack size in bytes (defaults to the scheduler's)
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

/// Result of running the scheduler to idle
#[derive(Debug, Clone)]
pub struct IdleReport {
    /// Exit code the main thread finished with
    pub exit_code: ExitCode,
    /// Exited threads nobody joined, released at teardown
    pub reclaimed: Vec<(ThreadId, Option<ExitCode>)>,
    pub stats: SchedulerStats,
}

struct Shared {
    state: Mutex<SchedulerState>,
    idle: IdleLatch,
    stack_size: usize,
    /// Stamped into every handle this scheduler issues
    tag: u64,
    /// OS thread that called `init`
    main_host: thread::ThreadId,
    /// User-held handles; carriers do not count
    handles: AtomicUsize,
    /// Shut down or abandoned
    closed: AtomicBool,
}

/// Cooperative scheduler handle.
///
/// Dropping the last handle without `shutdown` abandons every thread that
/// has not finished: parked carriers are woken and unwound, their routines
/// never resume.
pub struct Scheduler {
    shared: Arc<Shared>,
    counted: bool,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
            counted: true,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.counted && self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.abandon();
        }
    }
}

impl Scheduler {
    /// Initialize a scheduler and register the caller as its main thread.
    ///
    /// Fails with `AlreadyInitialized` if the calling OS thread already
    /// runs a thread of any scheduler.
    pub fn init(config: SchedulerConfig) -> ThreadResult<Self> {
        if ATTACHED.get() {
            return Err(ThreadError::AlreadyInitialized);
        }
        config.validate()?;

        let main_host = thread::current().id();
        let mut state = SchedulerState::new(&config);
        state.register_main(main_host)?;
        ATTACHED.set(true);
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "scheduler {tag} initialized: {:?} mode, {} byte stacks, {} threads max",
            config.mode,
            config.stack_size,
            state.store().capacity()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                idle: IdleLatch::default(),
                stack_size: config.stack_size,
                tag,
                main_host,
                handles: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
            }),
            counted: true,
        })
    }

    /// Create a thread running `routine(scheduler, arg)`; it becomes ready
    /// immediately and runs when dispatched.
    pub fn create<F, A>(&self, routine: F, arg: A) -> ThreadResult<ThreadHandle>
    where
        F: FnOnce(&Scheduler, A) -> ExitCode + Send + 'static,
        A: Send + 'static,
    {
        self.create_with(ThreadAttr::new(), routine, arg)
    }

    /// Create a thread with explicit attributes
    pub fn create_with<F, A>(&self, attr: ThreadAttr, routine: F, arg: A) -> ThreadResult<ThreadHandle>
    where
        F: FnOnce(&Scheduler, A) -> ExitCode + Send + 'static,
        A: Send + 'static,
    {
        let stack_size = attr.stack_size.unwrap_or(self.shared.stack_size);
        check_stack_size(stack_size)?;
        if attr.name.as_deref().is_some_and(|n| n.contains('\0')) {
            return Err(ThreadError::InvalidArgument("thread name contains NUL".into()));
        }

        let mut st = self.lock();
        st.running_on(thread::current().id())?;
        let id = st.allocate(attr.priority, attr.name.clone())?;
        let Some(context) = st.context_of(id) else {
            return Err(ThreadError::InvalidHandle(id));
        };

        let sched = self.carrier_handle();
        let carrier_name = attr.name.unwrap_or_else(|| format!("uthread-{id}"));
        match spawn_carrier(carrier_name, stack_size, move || carrier_main(sched, id, context)) {
            Ok(carrier) => {
                let start = Box::new(move |s: &Scheduler| routine(s, arg));
                st.admit(id, start, Some(Stack::new(stack_size, carrier)));
                Ok(self.handle(id))
            }
            Err(e) => {
                st.discard(id);
                Err(ThreadError::OutOfMemory(format!(
                    "stack of {stack_size} bytes for thread {id}: {e}"
                )))
            }
        }
    }

    /// Give up the processor to the next ready thread
    pub fn yield_now(&self) -> ThreadResult<()> {
        let (own, handoff) = {
            let mut st = self.lock();
            let me = st.running_on(thread::current().id())?;
            let own = st.context_of(me).ok_or(ThreadError::NotRunning)?;
            (own, st.yield_current()?)
        };
        self.suspend(&own, handoff);
        Ok(())
    }

    /// Wait for `handle` to exit and return its exit code.
    ///
    /// The caller is blocked until the target exits; the target's control
    /// block is released on return.
    pub fn join(&self, handle: ThreadHandle) -> ThreadResult<ExitCode> {
        let target = self.resolve(handle)?;
        loop {
            let mut st = self.lock();
            let me = st.running_on(thread::current().id())?;
            let own = st.context_of(me).ok_or(ThreadError::NotRunning)?;
            match st.join_step(target)? {
                JoinStep::Done(code, tcb) => {
                    drop(st);
                    reclaim(tcb);
                    return Ok(code);
                }
                JoinStep::Wait(handoff) => {
                    drop(st);
                    self.suspend(&own, handoff);
                }
            }
        }
    }

    /// Terminate the calling thread. Never returns.
    ///
    /// On the main thread this runs every remaining thread to completion
    /// and then terminates the process with `code`; use [`shutdown`] to
    /// get control back instead.
    ///
    /// # Panics
    ///
    /// Panics if the caller is not the running thread of this scheduler.
    ///
    /// [`shutdown`]: Scheduler::shutdown
    pub fn exit(&self, code: ExitCode) -> ! {
        let me = match self.lock().running_on(thread::current().id()) {
            Ok(me) => me,
            Err(e) => panic!("exit({code}): {e}"),
        };
        if me == ThreadId::MAIN {
            match self.shutdown(code) {
                Ok(report) => {
                    log::debug!("main exited, {} threads reclaimed", report.reclaimed.len());
                    std::process::exit(code)
                }
                Err(e) => panic!("exit({code}): {e}"),
            }
        }
        panic::resume_unwind(Box::new(ExitRequest(code)))
    }

    /// Exit the main thread with `code` and run the scheduler until idle.
    ///
    /// Every remaining thread runs to completion; exited threads nobody
    /// joined are released. Must be called from the main thread.
    pub fn shutdown(&self, code: ExitCode) -> ThreadResult<IdleReport> {
        let handoff = {
            let mut st = self.lock();
            let me = st.running_on(thread::current().id())?;
            if me != ThreadId::MAIN {
                return Err(ThreadError::InvalidArgument(format!(
                    "shutdown called from thread {me}, not main"
                )));
            }
            st.exit_current(code)?
        };
        if let Handoff::Switch { context, .. } = handoff {
            context.resume();
            self.shared.idle.wait();
        }

        let (released, stats) = {
            let mut st = self.lock();
            let released = st.teardown();
            (released, st.stats())
        };
        let reclaimed = released
            .into_iter()
            .map(|tcb| {
                let entry = (tcb.id(), tcb.exit_code());
                reclaim(tcb);
                entry
            })
            .collect();
        self.shared.closed.store(true, Ordering::Release);
        ATTACHED.set(false);
        log::debug!(
            "scheduler idle: {} dispatches, {} context switches",
            stats.dispatches,
            stats.context_switches
        );

        Ok(IdleReport {
            exit_code: code,
            reclaimed,
            stats,
        })
    }

    /// Handle of the running thread
    pub fn current(&self) -> Option<ThreadHandle> {
        let current = self.lock().current();
        current.map(|id| self.handle(id))
    }

    pub fn status(&self, handle: ThreadHandle) -> ThreadResult<ThreadStatus> {
        let id = self.resolve(handle)?;
        self.lock().status(id)
    }

    /// Run `f` on the control block of `handle`
    pub fn inspect<R>(&self, handle: ThreadHandle, f: impl FnOnce(&Tcb) -> R) -> ThreadResult<R> {
        let id = self.resolve(handle)?;
        let st = self.lock();
        st.store().get(id).map(f).ok_or(ThreadError::InvalidHandle(id))
    }

    pub fn stats(&self) -> SchedulerStats {
        self.lock().stats()
    }

    /// No thread left to run
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.shared.state.lock()
    }

    fn handle(&self, id: ThreadId) -> ThreadHandle {
        ThreadHandle {
            sched: self.shared.tag,
            id,
        }
    }

    /// Thread id behind `handle`, if this scheduler issued it
    fn resolve(&self, handle: ThreadHandle) -> ThreadResult<ThreadId> {
        if handle.sched == self.shared.tag {
            Ok(handle.id)
        } else {
            Err(ThreadError::InvalidHandle(handle.id))
        }
    }

    /// Handle held by a carrier; does not keep the scheduler alive
    fn carrier_handle(&self) -> Scheduler {
        Scheduler {
            shared: Arc::clone(&self.shared),
            counted: false,
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Unwind a thread woken by `abandon`
    fn check_abandoned(&self) {
        if self.is_closed() {
            panic::resume_unwind(Box::new(Abandoned));
        }
    }

    /// Tear down a scheduler whose last user handle was dropped
    fn abandon(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let here = thread::current().id();
        let evicted = self.lock().abandon();
        log::warn!(
            "scheduler {} dropped without shutdown, abandoning {} threads",
            self.shared.tag,
            evicted.len()
        );
        for mut tcb in evicted {
            tcb.start = None;
            let Some(stack) = tcb.stack.take() else {
                continue;
            };
            tcb.context.resume();
            // A carrier cannot wait for itself; it finishes on its own
            if stack.host() != here {
                stack.reclaim(tcb.id());
            }
        }
        if here == self.shared.main_host {
            ATTACHED.set(false);
        }
    }

    /// Carry out a handoff on behalf of a thread that stays alive
    fn suspend(&self, own: &Context, handoff: Handoff) {
        match handoff {
            Handoff::Stay => {}
            Handoff::Switch { context, .. } => {
                context.resume();
                own.capture();
                self.check_abandoned();
            }
            Handoff::Idle => {
                // The core never idles while a live caller waits
                log::error!("scheduler idle while a thread is suspended");
                self.shared.idle.release();
                own.capture();
                self.check_abandoned();
            }
        }
    }

    /// Exit bookkeeping for the thread whose routine just finished
    fn finish(&self, id: ThreadId, code: ExitCode) {
        if self.is_closed() {
            log::debug!("thread {id} finished after its scheduler was dropped");
            return;
        }
        let handoff = self.lock().exit_current(code);
        match handoff {
            Ok(Handoff::Switch { context, .. }) => context.resume(),
            Ok(Handoff::Idle) => self.shared.idle.release(),
            Ok(Handoff::Stay) => {}
            Err(e) => log::error!("thread {id}: exit failed: {e}"),
        }
    }
}

/// Body of a carrier OS thread
fn carrier_main(sched: Scheduler, id: ThreadId, context: Arc<Context>) {
    ATTACHED.set(true);
    context.capture();
    if sched.is_closed() {
        return;
    }

    let start = sched.lock().take_start(id);
    let code = match start {
        Some(start) => match panic::catch_unwind(AssertUnwindSafe(|| start(&sched))) {
            Ok(code) => code,
            Err(payload) if payload.is::<Abandoned>() => return,
            Err(payload) => match payload.downcast::<ExitRequest>() {
                Ok(request) => request.0,
                Err(payload) => {
                    log::warn!("thread {id} panicked: {}", panic_message(&*payload));
                    PANIC_EXIT_CODE
                }
            },
        },
        None => {
            log::error!("thread {id} dispatched without an entry point");
            PANIC_EXIT_CODE
        }
    };
    sched.finish(id, code);
}

/// Free the stack of a released control block
fn reclaim(mut tcb: Tcb) {
    if let Some(stack) = tcb.stack.take() {
        stack.reclaim(tcb.id());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueMode;

    fn testing() -> Scheduler {
        Scheduler::init(SchedulerConfig::testing()).unwrap()
    }

    #[test]
    fn test_init_twice() {
        let sched = testing();
        assert_eq!(
            Scheduler::init(SchedulerConfig::testing()).err(),
            Some(ThreadError::AlreadyInitialized)
        );
        sched.shutdown(0).unwrap();
        // Detached again after shutdown
        let again = testing();
        again.shutdown(0).unwrap();
    }

    #[test]
    fn test_join_exit_code() {
        let sched = testing();
        let h = sched.create(|_, x: i32| x * 2, 21).unwrap();
        assert_eq!(sched.status(h).unwrap(), ThreadStatus::New);
        assert_eq!(sched.join(h).unwrap(), 42);
        assert_eq!(sched.join(h).err(), Some(ThreadError::DoubleJoin(h.id())));
        sched.shutdown(0).unwrap();
    }

    #[test]
    fn test_explicit_exit() {
        let sched = testing();
        let h = sched
            .create(
                |s, _: ()| -> ExitCode { s.exit(42) },
                (),
            )
            .unwrap();
        assert_eq!(sched.join(h).unwrap(), 42);
        sched.shutdown(0).unwrap();
    }

    #[test]
    fn test_panic_exit_code() {
        let sched = testing();
        let h = sched
            .create(|_, _: ()| -> ExitCode { panic!("boom") }, ())
            .unwrap();
        assert_eq!(sched.join(h).unwrap(), PANIC_EXIT_CODE);
        sched.shutdown(0).unwrap();
    }

    #[test]
    fn test_idle_termination() {
        let sched = testing();
        let report = sched.shutdown(7).unwrap();
        assert_eq!(report.exit_code, 7);
        assert_eq!(report.reclaimed, vec![(ThreadId::MAIN, Some(7))]);
        assert!(sched.is_idle());
        assert_eq!(sched.yield_now().err(), Some(ThreadError::NotRunning));
        assert_eq!(sched.current(), None);
    }

    #[test]
    fn test_small_stack_rejected() {
        let sched = testing();
        let err = sched
            .create_with(ThreadAttr::new().stack_size(512), |_, _: ()| 0, ())
            .unwrap_err();
        assert!(matches!(err, ThreadError::InvalidArgument(_)));
        assert_eq!(sched.stats().created, 1);
        sched.shutdown(0).unwrap();
    }

    #[test]
    fn test_capacity_exhausted() {
        let sched = Scheduler::init(SchedulerConfig::testing().with_max_threads(2)).unwrap();
        let h = sched.create(|_, _: ()| 1, ()).unwrap();
        let err = sched.create(|_, _: ()| 2, ()).unwrap_err();
        assert!(matches!(err, ThreadError::OutOfMemory(_)));
        assert_eq!(sched.stats().ready, 1);
        assert_eq!(sched.join(h).unwrap(), 1);
        sched.shutdown(0).unwrap();
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_stack_allocation_failure_leaves_nothing_queued() {
        let sched = testing();
        let err = sched
            .create_with(ThreadAttr::new().stack_size(1usize << 50), |_, _: ()| 0, ())
            .unwrap_err();
        assert!(matches!(err, ThreadError::OutOfMemory(_)));
        let stats = sched.stats();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.discarded, 1);

        let report = sched.shutdown(0).unwrap();
        assert_eq!(report.stats.created, 1);
        assert_eq!(report.stats.created, report.stats.released);
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let sched = testing();
        let other = ThreadHandle {
            sched: sched.shared.tag + 1_000_000,
            id: ThreadId::MAIN,
        };
        assert_eq!(sched.status(other).err(), Some(ThreadError::InvalidHandle(ThreadId::MAIN)));
        assert_eq!(sched.join(other).err(), Some(ThreadError::InvalidHandle(ThreadId::MAIN)));
        assert!(sched.inspect(other, |t| t.id()).is_err());
        sched.shutdown(0).unwrap();
    }

    #[test]
    fn test_attr_name_and_priority() {
        let sched = Scheduler::init(SchedulerConfig::testing().with_mode(QueueMode::priority())).unwrap();
        let attr = ThreadAttr::new().name("worker").priority(ThreadPriority::HIGH);
        let h = sched.create_with(attr, |_, _: ()| 0, ()).unwrap();
        let (name, priority) = sched
            .inspect(h, |t| (t.name().map(String::from), t.priority()))
            .unwrap();
        assert_eq!(name.as_deref(), Some("worker"));
        assert_eq!(priority, ThreadPriority::HIGH);
        sched.join(h).unwrap();
        sched.shutdown(0).unwrap();
    }

    #[test]
    fn test_unjoined_reclaimed_at_shutdown() {
        let sched = testing();
        let h = sched.create(|_, _: ()| 5, ()).unwrap();
        let report = sched.shutdown(0).unwrap();
        assert!(report.reclaimed.contains(&(h.id(), Some(5))));
        assert_eq!(report.stats.created, report.stats.released);
        assert_eq!(report.stats.live, 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("bad"));
        assert_eq!(panic_message(&*payload), "bad");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
