//! # gridvm-core
//!
//! The task execution engine of gridvm: lock primitives, a blocking
//! concurrent queue over a caller-chosen lock, prioritized tasks with
//! future results, three interchangeable schedulers and a dynamically
//! sized worker thread pool with idle expiry, reservation and a timer
//! service. Platform-specific pieces (stacks, context switching) live in
//! `gridvm-runtime`; the node/port messaging fabric in `gridvm-fabric`.
//!
//! ## Modules
//!
//! - `spinlock` - spinlock with tunable back-off
//! - `locks` - lock policy trait and ordered two-lock acquisition
//! - `queue` - blocking concurrent queue
//! - `task` - task trait, function task, result futures
//! - `sched` - FIFO / LIFO / priority schedulers
//! - `pool` - worker thread pool and the executor trait
//! - `timer` - delayed and periodic task service
//! - `strand` - per-entity serialisation discipline
//! - `error` - error types

pub mod error;
pub mod locks;
pub mod pool;
pub mod queue;
pub mod sched;
pub mod spinlock;
pub mod strand;
pub mod task;
pub mod timer;

// Re-exports for convenience
pub use error::{LockError, LockResult, TaskError};
pub use locks::{Lockable, OrderedLock, RawMutex};
pub use pool::{ExecutionService, ThreadPool};
pub use queue::ConcurrentQueue;
pub use sched::{Scheduler, SchedulerKind};
pub use spinlock::{RawSpinLock, SpinLock};
pub use strand::Strand;
pub use task::{function_task, ForcedUnwind, FunctionTask, ResultSlot, Task, TaskRef};
pub use timer::TimerThread;
