//! Error types for the execution engine

use core::fmt;

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised by lock-contract violations
///
/// These mirror the POSIX error conditions: locking a guard that already
/// owns its locks would deadlock the calling thread, and unlocking a guard
/// that owns nothing is not permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Re-locking an already-owned guard
    WouldDeadlock,

    /// Unlocking an unowned or released guard
    NotPermitted,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::WouldDeadlock => write!(f, "resource deadlock would occur"),
            LockError::NotPermitted => write!(f, "operation not permitted"),
        }
    }
}

impl std::error::Error for LockError {}

/// Errors surfaced through a task's result slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task body panicked; the payload is rendered to text
    Panicked(String),

    /// The task was dropped without ever running
    Abandoned,

    /// The task was a coroutine that got canceled before completion
    Canceled,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            TaskError::Abandoned => write!(f, "task dropped before running"),
            TaskError::Canceled => write!(f, "task canceled"),
        }
    }
}

impl std::error::Error for TaskError {}
