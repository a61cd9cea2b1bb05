//! Thread control blocks and the store that owns them
//!
//! TCBs live in an arena indexed by thread id. Ids are handed out
//! sequentially and never reused, so a released slot stays empty and a
//! stale handle can be told apart from one that was never issued.
//!
//! Author: Moroya Sakamoto

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::Context;
use crate::error::{ThreadError, ThreadResult};
use crate::thread::Scheduler;

/// Exit status of a thread
pub type ExitCode = i32;

/// Entry point with its argument already bound; consumed at first dispatch
pub(crate) type StartRoutine = Box<dyn FnOnce(&Scheduler) -> ExitCode + Send + 'static>;

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The thread that called `init`
    pub const MAIN: ThreadId = ThreadId(0);

    /// Get raw value
    pub fn value(&self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread priority (lower number = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(pub u8);

impl ThreadPriority {
    /// Runs before everything else in priority mode
    pub const CRITICAL: ThreadPriority = ThreadPriority(0);
    pub const HIGH: ThreadPriority = ThreadPriority(64);
    pub const NORMAL: ThreadPriority = ThreadPriority(128);
    pub const LOW: ThreadPriority = ThreadPriority(192);
    /// Background work
    pub const IDLE: ThreadPriority = ThreadPriority(255);
}

impl Default for ThreadPriority {
    fn default() -> Self {
        ThreadPriority::NORMAL
    }
}

/// Thread lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created, waiting in the ready queue for its first dispatch
    New,
    /// Yielded, waiting in the ready queue
    Ready,
    /// The current thread
    Running,
    /// Waiting in `join` for another thread to exit
    Blocked,
    /// Finished; exit code not yet consumed
    Exited,
}

impl ThreadStatus {
    /// May sit in the ready queue
    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadStatus::New | ThreadStatus::Ready)
    }
}

/// Execution stack owned by a thread: the carrier OS thread sized at create
pub(crate) struct Stack {
    size: usize,
    carrier: JoinHandle<()>,
}

impl Stack {
    pub(crate) fn new(size: usize, carrier: JoinHandle<()>) -> Self {
        Self { size, carrier }
    }

    pub(crate) fn host(&self) -> std::thread::ThreadId {
        self.carrier.thread().id()
    }

    /// Wait for the carrier to finish unwinding and free its stack
    pub(crate) fn reclaim(self, owner: ThreadId) {
        if self.carrier.join().is_err() {
            log::warn!("thread {owner}: carrier terminated abnormally");
        }
    }
}

/// Thread control block
pub struct Tcb {
    id: ThreadId,
    name: Option<String>,
    pub(crate) status: ThreadStatus,
    priority: ThreadPriority,
    /// Accumulated CPU time (microseconds)
    pub(crate) cpu_time_us: u64,
    /// Clock reading at last dispatch
    pub(crate) dispatched_at: u64,
    pub(crate) dispatches: u64,
    pub(crate) context: Arc<Context>,
    pub(crate) stack: Option<Stack>,
    /// OS thread executing this logical thread
    pub(crate) host: Option<std::thread::ThreadId>,
    pub(crate) start: Option<StartRoutine>,
    pub(crate) exit_code: Option<ExitCode>,
    /// Thread blocked in `join` on this one
    pub(crate) joiner: Option<ThreadId>,
    /// Thread this one is blocked on
    pub(crate) waiting_on: Option<ThreadId>,
}

impl Tcb {
    fn new(id: ThreadId, priority: ThreadPriority, name: Option<String>) -> Self {
        Self {
            id,
            name,
            status: ThreadStatus::New,
            priority,
            cpu_time_us: 0,
            dispatched_at: 0,
            dispatches: 0,
            context: Arc::new(Context::new()),
            stack: None,
            host: None,
            start: None,
            exit_code: None,
            joiner: None,
            waiting_on: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn priority(&self) -> ThreadPriority {
        self.priority
    }

    /// CPU time charged so far (microseconds)
    pub fn cpu_time_us(&self) -> u64 {
        self.cpu_time_us
    }

    /// Number of times the thread was dispatched
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exit_code
    }

    /// Stack size in bytes (`None` for the main thread)
    pub fn stack_size(&self) -> Option<usize> {
        self.stack.as_ref().map(|s| s.size)
    }

    /// Label for log lines
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}({})", self.id, name),
            None => self.id.to_string(),
        }
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("cpu_time_us", &self.cpu_time_us)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Arena of thread control blocks
pub struct TcbStore {
    slots: Vec<Option<Tcb>>,
    /// Maximum number of live control blocks
    capacity: usize,
    live: usize,
    released: u64,
    /// Blocks dropped by a failed create
    discarded: u64,
}

impl TcbStore {
    /// Create an empty store holding at most `capacity` live TCBs
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            live: 0,
            released: 0,
            discarded: 0,
        }
    }

    /// Allocate a control block in NEW status, consuming the next id
    pub fn allocate(&mut self, priority: ThreadPriority, name: Option<String>) -> ThreadResult<ThreadId> {
        if self.live >= self.capacity {
            return Err(ThreadError::OutOfMemory(format!(
                "thread capacity of {} reached",
                self.capacity
            )));
        }
        let id = u32::try_from(self.slots.len())
            .map(ThreadId)
            .map_err(|_| ThreadError::OutOfMemory("thread ids exhausted".into()))?;

        self.slots.push(Some(Tcb::new(id, priority, name)));
        self.live += 1;
        Ok(id)
    }

    /// Release an exited control block, handing it back for stack reclamation
    pub fn release(&mut self, id: ThreadId) -> ThreadResult<Tcb> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(ThreadError::InvalidHandle(id))?;
        match slot {
            Some(tcb) if tcb.status == ThreadStatus::Exited => {}
            _ => return Err(ThreadError::InvalidHandle(id)),
        }
        let tcb = slot.take().ok_or(ThreadError::InvalidHandle(id))?;
        self.live -= 1;
        self.released += 1;
        Ok(tcb)
    }

    /// Drop a control block that was never dispatched (failed create)
    pub(crate) fn discard(&mut self, id: ThreadId) -> Option<Tcb> {
        let slot = self.slots.get_mut(id.index())?;
        if !matches!(slot, Some(tcb) if tcb.status == ThreadStatus::New) {
            return None;
        }
        self.live -= 1;
        self.discarded += 1;
        slot.take()
    }

    /// Remove a control block whatever its status (scheduler abandoned)
    pub(crate) fn evict(&mut self, id: ThreadId) -> Option<Tcb> {
        let tcb = self.slots.get_mut(id.index())?.take()?;
        self.live -= 1;
        self.released += 1;
        Some(tcb)
    }

    pub fn get(&self, id: ThreadId) -> Option<&Tcb> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Was this id ever handed out?
    pub fn was_allocated(&self, id: ThreadId) -> bool {
        id.index() < self.slots.len()
    }

    /// Number of live control blocks
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of ids handed out so far
    pub fn allocated(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Number of successful releases
    pub fn released(&self) -> u64 {
        self.released
    }

    /// Number of allocations undone by a failed create
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live control blocks in id order
    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let mut store = TcbStore::new(8);
        let a = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        let b = store.allocate(ThreadPriority::NORMAL, Some("b".into())).unwrap();
        assert_eq!(a, ThreadId(0));
        assert_eq!(b, ThreadId(1));
        assert_eq!(store.get(b).unwrap().name(), Some("b"));
        assert_eq!(store.get(a).unwrap().status(), ThreadStatus::New);
        assert_eq!(store.live(), 2);
    }

    #[test]
    fn test_capacity_exhausted() {
        let mut store = TcbStore::new(1);
        store.allocate(ThreadPriority::NORMAL, None).unwrap();
        let err = store.allocate(ThreadPriority::NORMAL, None).unwrap_err();
        assert!(matches!(err, ThreadError::OutOfMemory(_)));
    }

    #[test]
    fn test_release_requires_exited() {
        let mut store = TcbStore::new(4);
        let id = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        assert_eq!(store.release(id).unwrap_err(), ThreadError::InvalidHandle(id));

        store.get_mut(id).unwrap().status = ThreadStatus::Exited;
        let tcb = store.release(id).unwrap();
        assert_eq!(tcb.id(), id);
        assert_eq!(store.live(), 0);
        assert_eq!(store.released(), 1);
    }

    #[test]
    fn test_double_release() {
        let mut store = TcbStore::new(4);
        let id = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        store.get_mut(id).unwrap().status = ThreadStatus::Exited;
        store.release(id).unwrap();
        assert_eq!(store.release(id).unwrap_err(), ThreadError::InvalidHandle(id));
        assert_eq!(store.released(), 1);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut store = TcbStore::new(1);
        let first = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        store.get_mut(first).unwrap().status = ThreadStatus::Exited;
        store.release(first).unwrap();

        let second = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        assert_eq!(second, ThreadId(1));
        assert!(store.was_allocated(first));
        assert!(store.get(first).is_none());
        assert!(!store.was_allocated(ThreadId(2)));
    }

    #[test]
    fn test_discard_only_new() {
        let mut store = TcbStore::new(4);
        let id = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        store.get_mut(id).unwrap().status = ThreadStatus::Running;
        assert!(store.discard(id).is_none());

        store.get_mut(id).unwrap().status = ThreadStatus::New;
        assert!(store.discard(id).is_some());
        assert_eq!(store.live(), 0);
        assert_eq!(store.released(), 0);
        assert_eq!(store.discarded(), 1);
    }

    #[test]
    fn test_evict_any_status() {
        let mut store = TcbStore::new(4);
        let id = store.allocate(ThreadPriority::NORMAL, None).unwrap();
        store.get_mut(id).unwrap().status = ThreadStatus::Blocked;
        assert_eq!(store.evict(id).map(|t| t.id()), Some(id));
        assert!(store.evict(id).is_none());
        assert_eq!(store.live(), 0);
        assert_eq!(store.released(), 1);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(ThreadPriority::CRITICAL < ThreadPriority::HIGH);
        assert!(ThreadPriority::HIGH < ThreadPriority::NORMAL);
        assert!(ThreadPriority::NORMAL < ThreadPriority::LOW);
        assert_eq!(ThreadPriority::default(), ThreadPriority::NORMAL);
    }

    #[test]
    fn test_runnable_states() {
        assert!(ThreadStatus::New.is_runnable());
        assert!(ThreadStatus::Ready.is_runnable());
        assert!(!ThreadStatus::Running.is_runnable());
        assert!(!ThreadStatus::Blocked.is_runnable());
        assert!(!ThreadStatus::Exited.is_runnable());
    }
}
