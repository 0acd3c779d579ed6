//! Per-entity serialisation over a parallel executor
//!
//! A strand guarantees that at most one of its posted tasks runs at any
//! moment, and that tasks run in post order, even when the underlying
//! executor is multi-threaded. Used by the messaging fabric to keep each
//! node's handlers from racing themselves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::pool::ExecutionService;
use crate::task::{Task, TaskRef};

struct StrandState {
    queue: VecDeque<TaskRef>,
    running: bool,
}

struct StrandInner {
    exec: Arc<dyn ExecutionService>,
    state: Mutex<StrandState>,
}

/// A serialisation discipline attached to one entity
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new(exec: Arc<dyn ExecutionService>) -> Self {
        Strand {
            inner: Arc::new(StrandInner {
                exec,
                state: Mutex::new(StrandState {
                    queue: VecDeque::new(),
                    running: false,
                }),
            }),
        }
    }

    /// Enqueue `task`; it runs after every task posted before it
    pub fn post(&self, task: TaskRef) {
        let mut state = self.inner.state.lock().unwrap();
        if state.running {
            state.queue.push_back(task);
            return;
        }
        state.running = true;
        drop(state);
        self.dispatch(task);
    }

    fn dispatch(&self, task: TaskRef) {
        let job = Arc::new(StrandJob {
            strand: self.clone(),
            task,
        });
        self.inner.exec.execute(job);
    }

    fn complete(&self) {
        let mut state = self.inner.state.lock().unwrap();
        match state.queue.pop_front() {
            Some(next) => {
                drop(state);
                self.dispatch(next);
            }
            None => {
                state.running = false;
            }
        }
    }
}

struct StrandJob {
    strand: Strand,
    task: TaskRef,
}

impl Task for StrandJob {
    fn priority(&self) -> i32 {
        self.task.priority()
    }

    fn run(&self) {
        // The continuation must fire even if the task body panics,
        // otherwise the strand would stall forever
        struct Continue<'a>(&'a Strand);
        impl Drop for Continue<'_> {
            fn drop(&mut self) {
                self.0.complete();
            }
        }

        let _continue = Continue(&self.strand);
        self.task.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadPool;
    use crate::sched::SchedulerKind;
    use crate::task::function_task;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_post_order_preserved() {
        let pool: Arc<dyn ExecutionService> =
            Arc::new(ThreadPool::new(SchedulerKind::Fifo, 4));
        let strand = Strand::new(Arc::clone(&pool));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..64 {
            let order = Arc::clone(&order);
            let (task, _r) = function_task(0, move || {
                order.lock().unwrap().push(id);
            });
            strand.post(task);
        }

        std::thread::sleep(std::time::Duration::from_millis(300));
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_never_concurrent() {
        let pool: Arc<dyn ExecutionService> =
            Arc::new(ThreadPool::new(SchedulerKind::Fifo, 4));
        let strand = Strand::new(Arc::clone(&pool));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let done = Arc::clone(&done);
            let (task, _r) = function_task(0, move || {
                let cur = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(cur, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_micros(200));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
            strand.post(task);
        }

        while done.load(Ordering::SeqCst) < 32 {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_does_not_stall_strand() {
        let pool: Arc<dyn ExecutionService> =
            Arc::new(ThreadPool::new(SchedulerKind::Fifo, 2));
        let strand = Strand::new(Arc::clone(&pool));

        let (bad, _r) = function_task(0, || panic!("in strand"));
        strand.post(bad);

        let (good, result) = function_task(0, || 1);
        strand.post(good);
        assert_eq!(result.wait(), Ok(1));
    }
}
