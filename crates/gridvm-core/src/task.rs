//! Task abstraction and the callable-to-task adapter
//!
//! A task is a priority plus a `run` body, reference-shared between the
//! schedulers and the pool. [`FunctionTask`] wraps any `FnOnce` closure
//! into a task whose outcome is delivered through a [`ResultSlot`] —
//! panics inside the body are captured there, except the forced-unwind
//! sentinel used to cancel coroutines, which is always re-raised.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::TaskError;

/// Sentinel panic payload that unwinds a paused coroutine's stack
///
/// Never captured by result slots; anything observing it must let it
/// continue to propagate.
pub struct ForcedUnwind;

/// A schedulable unit of work
///
/// Higher priority values are more urgent. `run` consumes the body on
/// first call; later calls are no-ops.
pub trait Task: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }

    fn run(&self);
}

/// Shared handle to a task
pub type TaskRef = Arc<dyn Task>;

struct SlotState<R> {
    outcome: Mutex<Option<Result<R, TaskError>>>,
    cond: Condvar,
}

/// The future half of a task: blocks until the body produced a value
/// or failed
pub struct ResultSlot<R> {
    state: Arc<SlotState<R>>,
}

impl<R> Clone for ResultSlot<R> {
    fn clone(&self) -> Self {
        ResultSlot {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R> ResultSlot<R> {
    pub fn new() -> Self {
        ResultSlot {
            state: Arc::new(SlotState {
                outcome: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Store the outcome and wake all waiters; the first fulfillment wins
    pub fn fulfill(&self, outcome: Result<R, TaskError>) {
        let mut slot = self.state.outcome.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
            self.state.cond.notify_all();
        }
    }

    /// Block until the outcome arrives and take it
    pub fn wait(&self) -> Result<R, TaskError> {
        let mut slot = self.state.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self.state.cond.wait(slot).unwrap();
        }
    }

    /// Bounded wait; `None` when the timeout elapses first
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<R, TaskError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.state.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = slot.take() {
                return Some(outcome);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.state.cond.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }

    /// Non-blocking take
    pub fn try_take(&self) -> Option<Result<R, TaskError>> {
        self.state.outcome.lock().unwrap().take()
    }
}

impl<R> Default for ResultSlot<R> {
    fn default() -> Self {
        ResultSlot::new()
    }
}

/// Render a panic payload for the result slot
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Adapts any `FnOnce() -> R` closure into a prioritized task with a
/// result future
pub struct FunctionTask<F, R> {
    prio: i32,
    func: Mutex<Option<F>>,
    result: ResultSlot<R>,
}

impl<F, R> FunctionTask<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    pub fn new(prio: i32, func: F) -> Self {
        FunctionTask {
            prio,
            func: Mutex::new(Some(func)),
            result: ResultSlot::new(),
        }
    }

    /// The future result of this task
    pub fn result(&self) -> ResultSlot<R> {
        self.result.clone()
    }
}

impl<F, R> Task for FunctionTask<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    fn priority(&self) -> i32 {
        self.prio
    }

    fn run(&self) {
        let func = self.func.lock().unwrap().take();
        let Some(func) = func else { return };

        match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(value) => self.result.fulfill(Ok(value)),
            Err(payload) => {
                if payload.is::<ForcedUnwind>() {
                    // Coroutine teardown in progress; keep unwinding
                    panic::resume_unwind(payload);
                }
                self.result
                    .fulfill(Err(TaskError::Panicked(describe_panic(&*payload))));
            }
        }
    }
}

impl<F, R> Drop for FunctionTask<F, R> {
    fn drop(&mut self) {
        // A task dropped unrun must not leave its waiters blocked forever
        if self.func.get_mut().map(|f| f.is_some()).unwrap_or(false) {
            self.result.fulfill(Err(TaskError::Abandoned));
        }
    }
}

/// Build a shared function task and its result future in one step
pub fn function_task<F, R>(prio: i32, func: F) -> (TaskRef, ResultSlot<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let task = Arc::new(FunctionTask::new(prio, func));
    let result = task.result();
    (task, result)
}
