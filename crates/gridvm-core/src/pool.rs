//! Dynamically-sized worker thread pool
//!
//! Workers are spawned on demand up to `max_threads`, park on the pool
//! condition when the scheduler runs dry and retire after `expiry_timeout`
//! of idleness. Retired workers stay on an expired list and can be revived
//! with a fresh OS thread instead of allocating a new worker slot.
//!
//! Admission policy (`try_start`), the worker state machine and the
//! drain-in-rounds reset follow the pool state described in the crate docs:
//!
//! ```text
//! START ──► RUN_TASK ──(scheduler non-empty)──► RUN_TASK
//!                  │
//!                  ▼
//!              WAIT_SCHED (schedule(waiting_task_timeout))
//!                  │ task → RUN_TASK
//!                  ▼
//!              IDLE_WAIT (pool condvar, expiry_timeout)
//!                  │ direct task → RUN_TASK
//!                  │ timeout     → EXPIRED
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::sched::{Scheduler, SchedulerKind};
use crate::spinlock::SpinLock;
use crate::task::{describe_panic, function_task, ForcedUnwind, ResultSlot, TaskRef};
use crate::timer::TimerThread;

/// Default time an idle worker waits on the scheduler before parking
const DEFAULT_WAITING_TASK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time a parked worker lives before retiring
const DEFAULT_EXPIRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can run tasks now or later
pub trait ExecutionService: Send + Sync {
    /// Enqueue a task for execution
    fn execute(&self, task: TaskRef);

    /// Run `task` after `delay_ms`, then every `period_ms` when non-zero
    fn execute_with_delay(&self, task: TaskRef, delay_ms: u64, period_ms: u64);

    /// Stop accepting work and wake idle workers
    fn shutdown(&self);

    fn stopped(&self) -> bool;

    /// Run at most one queued task on the calling thread
    fn try_executing_one(&self) -> bool;
}

struct Worker {
    /// Waits with the pool mutex; signalled on direct handoff and shutdown
    cond: Condvar,

    /// Direct task handoff slot, set before the worker is started or woken
    slot: SpinLock<Option<TaskRef>>,

    thread: SpinLock<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new() -> Arc<Self> {
        Arc::new(Worker {
            cond: Condvar::new(),
            slot: SpinLock::new(None),
            thread: SpinLock::new(None),
        })
    }

    /// Hand over `task` and (re)start the worker thread
    fn start(self: &Arc<Self>, task: Option<TaskRef>, shared: &Arc<PoolShared>) {
        *self.slot.lock() = task;
        self.join();
        let me = Arc::clone(self);
        let shared = Arc::clone(shared);
        let handle = std::thread::Builder::new()
            .name("gridvm-worker".into())
            .spawn(move || worker_loop(shared, me))
            .expect("failed to spawn worker thread");
        *self.thread.lock() = Some(handle);
    }

    fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct PoolInner {
    workers: Vec<Arc<Worker>>,
    waiters: Vec<Arc<Worker>>,
    expired: Vec<Arc<Worker>>,

    /// Workers currently between start and inactivation
    active: usize,

    /// Slots counted outside the concurrency limit
    reserved: usize,

    max_threads: usize,
}

impl PoolInner {
    fn active_thread_count(&self) -> usize {
        self.workers.len() - self.waiters.len() - self.expired.len() + self.reserved
    }

    fn too_many_active(&self) -> bool {
        let count = self.active_thread_count();
        count > self.max_threads && (count - self.reserved) > 1
    }
}

struct PoolShared {
    sched: Arc<Scheduler>,
    inner: Mutex<PoolInner>,

    /// Signalled whenever `active` drops to zero
    no_active: Condvar,

    shutdown: AtomicBool,
    waiting_task_timeout_ms: AtomicU64,
    expiry_timeout_ms: AtomicU64,
    timer: OnceLock<TimerThread>,
}

impl PoolShared {
    fn waiting_task_timeout(&self) -> Duration {
        Duration::from_millis(self.waiting_task_timeout_ms.load(Ordering::Relaxed))
    }

    fn expiry_timeout(&self) -> Duration {
        Duration::from_millis(self.expiry_timeout_ms.load(Ordering::Relaxed))
    }

    fn inactivate(&self, inner: &mut PoolInner) {
        inner.active -= 1;
        if inner.active == 0 {
            self.no_active.notify_all();
        }
    }

    fn start_thread(self: &Arc<Self>, inner: &mut PoolInner, task: Option<TaskRef>) {
        let worker = Worker::new();
        inner.workers.push(Arc::clone(&worker));
        inner.active += 1;
        worker.start(task, self);
    }

    /// Admission policy; gives the task back when the pool is saturated
    fn try_start(self: &Arc<Self>, inner: &mut PoolInner, task: TaskRef) -> Result<(), TaskRef> {
        if inner.workers.is_empty() {
            self.start_thread(inner, Some(task));
            return Ok(());
        }

        if inner.active_thread_count() >= inner.max_threads {
            return Err(task);
        }

        if let Some(waiter) = pop_front(&mut inner.waiters) {
            self.sched.push(task);
            waiter.cond.notify_one();
            return Ok(());
        }

        if let Some(expired) = pop_front(&mut inner.expired) {
            inner.active += 1;
            expired.start(Some(task), self);
            return Ok(());
        }

        self.start_thread(inner, Some(task));
        Ok(())
    }

    /// Feed queued tasks to fresh workers while capacity remains
    fn try_to_start_more(self: &Arc<Self>, inner: &mut PoolInner) {
        loop {
            if self.sched.empty() {
                break;
            }
            if !inner.workers.is_empty() && inner.active_thread_count() >= inner.max_threads {
                break;
            }
            let Some(task) = self.sched.try_schedule() else {
                break;
            };
            // Cannot fail: capacity was just checked under the same lock
            let _ = self.try_start(inner, task);
        }
    }

    fn execute_task(self: &Arc<Self>, task: TaskRef) {
        let mut inner = self.inner.lock().unwrap();
        if let Err(task) = self.try_start(&mut inner, task) {
            self.sched.push(task);
            if let Some(waiter) = pop_front(&mut inner.waiters) {
                waiter.cond.notify_one();
            }
        }
    }
}

fn pop_front(list: &mut Vec<Arc<Worker>>) -> Option<Arc<Worker>> {
    if list.is_empty() {
        None
    } else {
        Some(list.remove(0))
    }
}

fn run_guarded(task: &TaskRef) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        if payload.is::<ForcedUnwind>() {
            // Never expected outside coroutine teardown; do not kill the worker
            tracing::error!("forced unwind escaped a task body");
            return;
        }
        tracing::error!(panic = %describe_panic(&*payload), "pool task panicked");
    }
}

fn worker_loop(shared: Arc<PoolShared>, me: Arc<Worker>) {
    loop {
        // RUN_TASK / WAIT_SCHED
        loop {
            let task = me
                .slot
                .lock()
                .take()
                .or_else(|| shared.sched.schedule(shared.waiting_task_timeout()));
            if let Some(task) = task {
                run_guarded(&task);
            }
            if shared.sched.empty() {
                break;
            }
        }

        let mut inner = shared.inner.lock().unwrap();
        let mut expired = inner.too_many_active() || shared.shutdown.load(Ordering::Acquire);

        if !expired {
            // IDLE_WAIT
            inner.waiters.push(Arc::clone(&me));
            shared.inactivate(&mut inner);
            let expiry = shared.expiry_timeout();
            let (guard, timeout) = me.cond.wait_timeout(inner, expiry).unwrap();
            inner = guard;
            inner.active += 1;
            inner.waiters.retain(|w| !Arc::ptr_eq(w, &me));

            let has_direct = me.slot.lock().is_some();
            if timeout.timed_out() && !has_direct {
                // A push that raced the timeout keeps the worker alive
                expired = shared.sched.empty();
            } else {
                expired = !(has_direct || !shared.sched.empty());
            }
            expired = expired || shared.shutdown.load(Ordering::Acquire);
        }

        if expired {
            inner.expired.push(Arc::clone(&me));
            shared.inactivate(&mut inner);
            return;
        }
        drop(inner);
    }
}

/// The worker thread pool
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Construct a pool using the scheduler policy `kind`
    ///
    /// A `max_threads` of zero selects the machine's available parallelism.
    pub fn new(kind: SchedulerKind, max_threads: usize) -> Self {
        Self::with_scheduler(Arc::new(Scheduler::new(kind)), max_threads)
    }

    /// Construct a pool around an existing scheduler
    pub fn with_scheduler(sched: Arc<Scheduler>, max_threads: usize) -> Self {
        let max_threads = if max_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            max_threads
        };

        ThreadPool {
            shared: Arc::new(PoolShared {
                sched,
                inner: Mutex::new(PoolInner {
                    workers: Vec::new(),
                    waiters: Vec::new(),
                    expired: Vec::new(),
                    active: 0,
                    reserved: 0,
                    max_threads,
                }),
                no_active: Condvar::new(),
                shutdown: AtomicBool::new(false),
                waiting_task_timeout_ms: AtomicU64::new(
                    DEFAULT_WAITING_TASK_TIMEOUT.as_millis() as u64,
                ),
                expiry_timeout_ms: AtomicU64::new(DEFAULT_EXPIRY_TIMEOUT.as_millis() as u64),
                timer: OnceLock::new(),
            }),
        }
    }

    /// Submit a closure with `prio`, returning its future result
    pub fn run_async<F, R>(&self, prio: i32, func: F) -> ResultSlot<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (task, result) = function_task(prio, func);
        self.execute(task);
        result
    }

    /// Wait for all work to finish, then tear the worker set down
    ///
    /// Negative `msecs` waits without bound. Returns `true` when the pool
    /// reached quiescence (in which case the reset has run).
    pub fn wait_for_done(&self, msecs: i64) -> bool {
        let done = self.wait_quiescent(msecs);
        if done {
            self.reset();
        }
        done
    }

    fn wait_quiescent(&self, msecs: i64) -> bool {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();

        // Tasks stranded without a live worker still have to run
        shared.try_to_start_more(&mut inner);

        for waiter in inner.waiters.iter() {
            waiter.cond.notify_one();
        }

        fn done(shared: &PoolShared, inner: &MutexGuard<'_, PoolInner>) -> bool {
            shared.sched.empty() && inner.active == 0
        }

        if msecs < 0 {
            while !done(shared, &inner) {
                inner = shared.no_active.wait(inner).unwrap();
            }
            true
        } else {
            let deadline = Instant::now() + Duration::from_millis(msecs as u64);
            while !done(shared, &inner) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = shared.no_active.wait_timeout(inner, deadline - now).unwrap();
                inner = guard;
            }
            done(shared, &inner)
        }
    }

    /// Stop the scheduler and drain every worker in rounds
    fn reset(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();
        shared.shutdown.store(true, Ordering::Release);
        shared.sched.stop();

        while !inner.workers.is_empty() {
            let victims = core::mem::take(&mut inner.workers);
            drop(inner);

            for worker in &victims {
                worker.cond.notify_all();
                worker.join();
            }

            inner = shared.inner.lock().unwrap();
        }

        inner.waiters.clear();
        inner.expired.clear();
        shared.shutdown.store(false, Ordering::Release);
    }

    /// Hold one worker slot outside the concurrency limit
    pub fn reserve_thread(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.reserved += 1;
    }

    /// Give a reserved slot back and retry admission for queued work
    pub fn release_thread(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.reserved -= 1;
        self.shared.try_to_start_more(&mut inner);
    }

    pub fn expiry_timeout(&self) -> Duration {
        self.shared.expiry_timeout()
    }

    pub fn set_expiry_timeout(&self, timeout: Duration) {
        self.shared
            .expiry_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn waiting_task_timeout(&self) -> Duration {
        self.shared.waiting_task_timeout()
    }

    pub fn set_waiting_task_timeout(&self, timeout: Duration) {
        self.shared
            .waiting_task_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn max_thread_count(&self) -> usize {
        self.shared.inner.lock().unwrap().max_threads
    }

    pub fn set_max_thread_count(&self, count: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.max_threads = count;
        self.shared.try_to_start_more(&mut inner);
    }

    /// Number of workers currently counted against the limit
    pub fn thread_count(&self) -> usize {
        self.shared.inner.lock().unwrap().active_thread_count()
    }

    /// Discard all queued tasks
    pub fn clear(&self) {
        self.shared.sched.clear();
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.sched
    }
}

impl ExecutionService for ThreadPool {
    fn execute(&self, task: TaskRef) {
        self.shared.execute_task(task);
    }

    fn execute_with_delay(&self, task: TaskRef, delay_ms: u64, period_ms: u64) {
        let shared = &self.shared;
        let timer = shared.timer.get_or_init(|| {
            let weak: Weak<PoolShared> = Arc::downgrade(shared);
            TimerThread::start(move |task| {
                if let Some(shared) = weak.upgrade() {
                    shared.execute_task(task);
                }
            })
        });
        timer.schedule(
            task,
            Duration::from_millis(delay_ms),
            (period_ms > 0).then(|| Duration::from_millis(period_ms)),
        );
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.sched.stop();
    }

    fn stopped(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn try_executing_one(&self) -> bool {
        match self.shared.sched.schedule(self.waiting_task_timeout()) {
            Some(task) => {
                run_guarded(&task);
                true
            }
            None => false,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.timer.get() {
            timer.shutdown();
        }
        self.wait_for_done(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_run_async_result() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 2);
        let result = pool.run_async(0, || 6 * 7);
        assert_eq!(result.wait(), Ok(42));
    }

    #[test]
    fn test_wait_for_done_quiesces() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 4);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let hits = Arc::clone(&hits);
            pool.run_async(0, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(pool.wait_for_done(-1));
        assert_eq!(hits.load(Ordering::Relaxed), 32);
        assert!(pool.scheduler().empty());
        assert_eq!(pool.shared.inner.lock().unwrap().active, 0);
    }

    #[test]
    fn test_priority_completion_order() {
        let pool = ThreadPool::new(SchedulerKind::Prio, 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only worker so A/B/C queue up in the scheduler
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        pool.run_async(10, move || {
            ready_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        });
        ready_rx.recv().unwrap();

        for (name, prio) in [("A", 1), ("B", 3), ("C", 2)] {
            let order = Arc::clone(&order);
            pool.run_async(prio, move || {
                order.lock().unwrap().push(name);
            });
        }

        gate_tx.send(()).unwrap();
        assert!(pool.wait_for_done(-1));
        assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_reserve_does_not_starve() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 2);
        pool.reserve_thread();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            pool.run_async(0, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.release_thread();
        assert!(pool.wait_for_done(-1));
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_try_executing_one() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 1);
        // Reserve so execute cannot start a worker and the task stays queued
        pool.reserve_thread();
        let first = pool.run_async(0, || ());
        // First submission spawns the initial worker regardless; wait it out
        assert_eq!(first.wait(), Ok(()));
        std::thread::sleep(Duration::from_millis(50));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        pool.scheduler().push({
            let (task, _r) = function_task(0, move || {
                hits2.fetch_add(1, Ordering::Relaxed);
            });
            task
        });
        assert!(pool.try_executing_one());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        pool.release_thread();
    }

    #[test]
    fn test_task_panic_does_not_kill_pool() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 1);
        let bad = pool.run_async(0, || panic!("sacrificial"));
        assert!(matches!(bad.wait(), Err(_)));
        let good = pool.run_async(0, || 5);
        assert_eq!(good.wait(), Ok(5));
    }

    #[test]
    fn test_execute_with_delay_one_shot() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 1);
        let (task, result) = function_task(0, || 1);
        let start = Instant::now();
        pool.execute_with_delay(task, 50, 0);
        assert_eq!(result.wait(), Ok(1));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_execute_with_delay_periodic() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        // Periodic tasks re-run; the closure-based task is one-shot, so
        // count through a dedicated task type
        struct CountTask(Arc<AtomicUsize>);
        impl crate::task::Task for CountTask {
            fn run(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        pool.execute_with_delay(Arc::new(CountTask(hits2)), 10, 20);
        std::thread::sleep(Duration::from_millis(120));
        let seen = hits.load(Ordering::Relaxed);
        assert!(seen >= 3, "periodic task fired {} times", seen);
    }

    #[test]
    fn test_set_max_thread_count_starts_more() {
        let pool = ThreadPool::new(SchedulerKind::Fifo, 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        pool.run_async(0, move || {
            ready_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        });
        ready_rx.recv().unwrap();

        let second = pool.run_async(0, || 2);
        // Single-threaded and busy: the task must still be pending
        assert!(second.wait_for(Duration::from_millis(50)).is_none());

        pool.set_max_thread_count(2);
        assert_eq!(second.wait(), Ok(2));
        gate_tx.send(()).unwrap();
        pool.wait_for_done(-1);
    }
}
