//! Stackful coroutine tasks
//!
//! A [`CoroutineTask`] is a pool task whose body runs on its own guarded
//! stack and can suspend itself with [`this_coroutine::yield_now`]. The
//! suspended task is rescheduled like any other; each `run` resumes where
//! the body left off.
//!
//! State machine:
//!
//! ```text
//! NotInit ──run──► Ready ──► Running ──► {Paused, Canceled, Finished, Error}
//!                    ▲                      │
//!                    └───── run (resume) ───┘ (Paused only)
//! ```
//!
//! Dropping a paused coroutine resumes it one last time with an unwind
//! request; the body observes a sentinel panic, its stack unwinds through
//! every live frame, and the task ends `Canceled` before the stack is
//! released. The sentinel never escapes the coroutine.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use gridvm_core::error::TaskError;
use gridvm_core::task::{describe_panic, ForcedUnwind, ResultSlot, Task, TaskRef};

use crate::context::{init_context, switch_context, MachineContext};
use crate::stack::{default_stack_size, Stack};

/// Lifecycle of a coroutine task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoState {
    NotInit,
    Ready,
    Running,
    Paused,
    Canceled,
    Finished,
    Error,
}

// Payloads crossing the context switch. Commands flow into the
// coroutine, states flow out; the ranges are kept disjoint so a confused
// switch is loud in a debugger.
const CMD_RUN: usize = 0;
const CMD_UNWIND: usize = 1;

const ST_PAUSED: usize = 2;
const ST_CANCELED: usize = 3;
const ST_FINISHED: usize = 4;
const ST_ERROR: usize = 5;

fn decode_state(payload: usize) -> CoState {
    match payload {
        ST_PAUSED => CoState::Paused,
        ST_CANCELED => CoState::Canceled,
        ST_FINISHED => CoState::Finished,
        _ => CoState::Error,
    }
}

#[derive(Clone, Copy)]
struct CoActive {
    co_ctx: *mut MachineContext,
    caller_ctx: *mut MachineContext,
}

thread_local! {
    static CURRENT_CO: Cell<Option<CoActive>> = const { Cell::new(None) };
}

struct CoControl {
    state: CoState,
    stack_size: usize,
    stack: Option<Stack>,
    co_ctx: MachineContext,
    caller_ctx: MachineContext,
}

/// Switch into the coroutine and decode the state it reports back
///
/// Safety: `ctl` must hold an initialized coroutine context whose stack
/// is alive, and no other thread may resume it concurrently (guaranteed
/// by the control-block mutex held by every caller).
unsafe fn resume(ctl: &mut CoControl, cmd: usize) -> CoState {
    let active = CoActive {
        co_ctx: &mut ctl.co_ctx,
        caller_ctx: &mut ctl.caller_ctx,
    };
    let prev = CURRENT_CO.with(|cur| cur.replace(Some(active)));
    let payload = switch_context(active.caller_ctx, active.co_ctx, cmd);
    CURRENT_CO.with(|cur| cur.set(prev));
    decode_state(payload)
}

/// Suspend the current coroutine, or the OS thread when called outside
/// of one
pub mod this_coroutine {
    use super::*;

    pub fn yield_now() {
        let Some(active) = CURRENT_CO.with(|cur| cur.get()) else {
            std::thread::yield_now();
            return;
        };
        // Safety: we are on the coroutine's stack, so both contexts are
        // alive and owned by the suspended `run` frame above us
        let cmd = unsafe { switch_context(active.co_ctx, active.caller_ctx, ST_PAUSED) };
        if cmd == CMD_UNWIND {
            panic::panic_any(ForcedUnwind);
        }
    }

    /// Whether the calling code runs inside a coroutine
    pub fn is_coroutine() -> bool {
        CURRENT_CO.with(|cur| cur.get()).is_some()
    }
}

/// A task whose body is a stackful coroutine
///
/// The stack is allocated lazily on the first `run`. The result of the
/// body is delivered through a [`ResultSlot`]; a panic in the body ends
/// the coroutine in [`CoState::Error`] with the panic captured there.
pub struct CoroutineTask<F, R> {
    prio: i32,
    func: Mutex<Option<F>>,
    result: ResultSlot<R>,
    ctl: Mutex<CoControl>,
}

// Safety: the control block (raw contexts + stack) is only touched under
// its mutex, and a coroutine is resumed by at most one thread at a time
unsafe impl<F: Send, R: Send> Send for CoroutineTask<F, R> {}
unsafe impl<F: Send, R: Send> Sync for CoroutineTask<F, R> {}

impl<F, R> CoroutineTask<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    pub fn new(prio: i32, func: F) -> Self {
        CoroutineTask {
            prio,
            func: Mutex::new(Some(func)),
            result: ResultSlot::new(),
            ctl: Mutex::new(CoControl {
                state: CoState::NotInit,
                stack_size: default_stack_size(),
                stack: None,
                co_ctx: MachineContext::new(),
                caller_ctx: MachineContext::new(),
            }),
        }
    }

    /// Build a shared coroutine task plus its future result
    pub fn spawn(prio: i32, func: F) -> (Arc<Self>, ResultSlot<R>) {
        let task = Arc::new(Self::new(prio, func));
        let result = task.result();
        (task, result)
    }

    pub fn result(&self) -> ResultSlot<R> {
        self.result.clone()
    }

    pub fn state(&self) -> CoState {
        self.ctl.lock().unwrap().state
    }

    /// Adjust the stack size; only effective before the first `run`
    pub fn set_stack_size(&self, size: usize) {
        let mut ctl = self.ctl.lock().unwrap();
        if ctl.state == CoState::NotInit {
            ctl.stack_size = size;
        }
    }

    pub fn stack_size(&self) -> usize {
        self.ctl.lock().unwrap().stack_size
    }
}

impl<F, R> Task for CoroutineTask<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    fn priority(&self) -> i32 {
        self.prio
    }

    fn run(&self) {
        let mut ctl = self.ctl.lock().unwrap();

        if ctl.state == CoState::NotInit {
            let stack = Stack::allocate(ctl.stack_size);
            // Safety: the stack outlives the context because both live in
            // the control block and the stack is dropped only after the
            // coroutine reached a terminal state
            unsafe {
                init_context(
                    &mut ctl.co_ctx,
                    stack.top(),
                    co_entry::<F, R>,
                    self as *const _ as usize,
                );
            }
            ctl.stack = Some(stack);
            ctl.state = CoState::Ready;
        }

        if !matches!(ctl.state, CoState::Ready | CoState::Paused) {
            return;
        }

        ctl.state = CoState::Running;
        // Safety: state was Ready or Paused, so the context is suspended
        let next = unsafe { resume(&mut *ctl, CMD_RUN) };
        ctl.state = next;

        debug_assert!(matches!(
            next,
            CoState::Paused | CoState::Canceled | CoState::Finished | CoState::Error
        ));
    }
}

impl<F, R> Drop for CoroutineTask<F, R> {
    fn drop(&mut self) {
        let ctl = self.ctl.get_mut().unwrap_or_else(|e| e.into_inner());
        debug_assert!(ctl.state != CoState::Running);

        if ctl.state == CoState::Paused {
            // Resume one last time with an unwind request so every frame
            // on the coroutine stack runs its destructors
            let next = unsafe { resume(ctl, CMD_UNWIND) };
            ctl.state = next;
            debug_assert_eq!(next, CoState::Canceled);
            self.result.fulfill(Err(TaskError::Canceled));
        } else if self
            .func
            .get_mut()
            .map(|f| f.is_some())
            .unwrap_or(false)
        {
            self.result.fulfill(Err(TaskError::Abandoned));
        }
        // The stack unmaps with the control block
    }
}

/// Body of every coroutine; runs on the coroutine's own stack
extern "C" fn co_entry<F, R>(arg: usize, payload: usize)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    // Safety: `arg` is the task address, kept alive by the suspended
    // `run`/`drop` frame that switched into us
    let task = unsafe { &*(arg as *const CoroutineTask<F, R>) };

    let final_state = if payload == CMD_UNWIND {
        // Unwound before the body ever ran
        ST_CANCELED
    } else {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let func = task.func.lock().unwrap().take();
            func.map(|f| f())
        }));
        match outcome {
            Ok(Some(value)) => {
                task.result.fulfill(Ok(value));
                ST_FINISHED
            }
            Ok(None) => ST_FINISHED,
            Err(p) if p.is::<ForcedUnwind>() => ST_CANCELED,
            Err(p) => {
                task.result
                    .fulfill(Err(TaskError::Panicked(describe_panic(&*p))));
                ST_ERROR
            }
        }
    };

    // Final switch out; control never comes back to this stack
    let active = CURRENT_CO
        .with(|cur| cur.get())
        .expect("coroutine entry without active context");
    unsafe {
        switch_context(active.co_ctx, active.caller_ctx, final_state);
    }
    unreachable!("coroutine resumed after terminal state");
}

/// Build a shared coroutine task as a plain [`TaskRef`]
pub fn coroutine_task<F, R>(prio: i32, func: F) -> (TaskRef, ResultSlot<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (task, result) = CoroutineTask::spawn(prio, func);
    let task: TaskRef = task;
    (task, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_run_to_completion() {
        let (task, result) = CoroutineTask::spawn(0, || 40 + 2);
        assert_eq!(task.state(), CoState::NotInit);
        task.run();
        assert_eq!(task.state(), CoState::Finished);
        assert_eq!(result.wait(), Ok(42));
    }

    #[test]
    fn test_yield_and_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = Arc::clone(&steps);
        let (task, result) = CoroutineTask::spawn(0, move || {
            for _ in 0..3 {
                steps2.fetch_add(1, Ordering::SeqCst);
                this_coroutine::yield_now();
            }
            "done"
        });

        task.run();
        assert_eq!(task.state(), CoState::Paused);
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        task.run();
        assert_eq!(steps.load(Ordering::SeqCst), 2);

        task.run();
        task.run();
        assert_eq!(task.state(), CoState::Finished);
        assert_eq!(result.wait(), Ok("done"));

        // Further runs are no-ops
        task.run();
        assert_eq!(task.state(), CoState::Finished);
    }

    #[test]
    fn test_drop_paused_cancels_and_unwinds() {
        struct UnwindProbe(Arc<AtomicBool>);
        impl Drop for UnwindProbe {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let unwound = Arc::new(AtomicBool::new(false));
        let probe = UnwindProbe(Arc::clone(&unwound));

        let (task, result) = CoroutineTask::spawn(0, move || {
            let _probe = probe;
            loop {
                this_coroutine::yield_now();
            }
        });

        task.run();
        assert_eq!(task.state(), CoState::Paused);
        assert!(!unwound.load(Ordering::SeqCst));

        drop(task);
        // The probe lived on the coroutine stack; its destructor proves
        // the stack unwound instead of being abandoned
        assert!(unwound.load(Ordering::SeqCst));
        assert_eq!(result.wait(), Err(TaskError::Canceled));
    }

    #[test]
    fn test_panic_surfaces_as_error() {
        let (task, result) = CoroutineTask::spawn(0, || -> u32 {
            this_coroutine::yield_now();
            panic!("inner failure");
        });
        task.run();
        assert_eq!(task.state(), CoState::Paused);
        task.run();
        assert_eq!(task.state(), CoState::Error);
        match result.wait() {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("inner failure")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_runs_on_pool() {
        use gridvm_core::pool::{ExecutionService, ThreadPool};
        use gridvm_core::sched::SchedulerKind;

        let pool = ThreadPool::new(SchedulerKind::Fifo, 2);
        let (task, result) = coroutine_task(0, || {
            let mut acc = 0u64;
            for i in 0..5 {
                acc += i;
                this_coroutine::yield_now();
            }
            acc
        });

        // Re-execute until the coroutine finishes; each run resumes it
        loop {
            pool.execute(Arc::clone(&task));
            if let Some(outcome) = result.wait_for(std::time::Duration::from_millis(50)) {
                assert_eq!(outcome, Ok(10));
                break;
            }
        }
        pool.wait_for_done(-1);
    }

    #[test]
    fn test_stack_size_before_init_only() {
        let (task, _result) = CoroutineTask::spawn(0, || ());
        task.set_stack_size(4 * default_stack_size());
        assert_eq!(task.stack_size(), 4 * default_stack_size());
        task.run();
        let after = task.stack_size();
        task.set_stack_size(1);
        assert_eq!(task.stack_size(), after);
    }
}
