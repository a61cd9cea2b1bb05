//! Error types for uthread
//!
//! Usage errors are returned synchronously and never retried by the library.
//! Resource exhaustion leaves no partially registered thread behind.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

use crate::tcb::ThreadId;

/// Result type for thread operations
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Thread library error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    // ========== Usage Errors ==========

    /// The calling OS thread already belongs to a scheduler
    #[error("Thread library already initialized on this thread")]
    AlreadyInitialized,

    /// Bad argument or configuration value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle was never issued by this scheduler, or the thread is not exited
    #[error("Invalid thread handle: {0}")]
    InvalidHandle(ThreadId),

    /// Thread was already joined (or another thread is joining it)
    #[error("Thread {0} already joined")]
    DoubleJoin(ThreadId),

    /// No logical thread is running on the calling OS thread
    #[error("No thread is running")]
    NotRunning,

    /// Joining would never complete
    #[error("Joining thread {0} would deadlock")]
    Deadlock(ThreadId),

    // ========== Resource Errors ==========

    /// Control block or stack could not be allocated
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
}

impl ThreadError {
    /// Caller misuse, as opposed to resource exhaustion
    pub fn is_usage_error(&self) -> bool {
        !matches!(self, ThreadError::OutOfMemory(_))
    }

    /// POSIX error number for this error (what a pthread-style API returns)
    pub fn errno(&self) -> i32 {
        match self {
            ThreadError::AlreadyInitialized => 22, // EINVAL
            ThreadError::InvalidArgument(_) => 22, // EINVAL
            ThreadError::InvalidHandle(_) => 3,    // ESRCH
            ThreadError::DoubleJoin(_) => 22,      // EINVAL
            ThreadError::NotRunning => 1,          // EPERM
            ThreadError::Deadlock(_) => 35,        // EDEADLK
            ThreadError::OutOfMemory(_) => 12,     // ENOMEM
        }
    }
}
