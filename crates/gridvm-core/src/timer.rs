//! Timer thread for delayed and periodic tasks
//!
//! A single thread sleeps on a min-heap of deadlines and hands expired
//! tasks to a posting callback (normally the owning pool). Periodic
//! entries re-arm themselves after each fire.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::spinlock::SpinLock;
use crate::task::TaskRef;

struct TimerEntry {
    deadline: Instant,
    period: Option<Duration>,
    seq: u64,
    task: TaskRef,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: the earliest deadline surfaces at the heap top
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    entries: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Handle to a running timer thread
pub struct TimerThread {
    shared: Arc<TimerShared>,
    handle: SpinLock<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Spawn the timer thread; `post` receives each expired task
    pub fn start<P>(post: P) -> Self
    where
        P: Fn(TaskRef) + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("gridvm-timer".into())
            .spawn(move || timer_loop(loop_shared, post))
            .expect("failed to spawn timer thread");

        TimerThread {
            shared,
            handle: SpinLock::new(Some(handle)),
        }
    }

    /// Arm `task` to fire after `delay`, then every `period` if given
    pub fn schedule(&self, task: TaskRef, delay: Duration, period: Option<Duration>) {
        let mut state = self.shared.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(TimerEntry {
            deadline: Instant::now() + delay,
            period,
            seq,
            task,
        });
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Number of armed entries
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and join the timer thread; pending entries are discarded
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.entries.clear();
        }
        self.shared.cond.notify_all();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop<P>(shared: Arc<TimerShared>, post: P)
where
    P: Fn(TaskRef),
{
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        match state.entries.peek() {
            Some(top) if top.deadline <= now => {
                let entry = state.entries.pop().expect("peeked entry");
                let task = entry.task;
                if let Some(period) = entry.period {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.entries.push(TimerEntry {
                        deadline: now + period,
                        period: Some(period),
                        seq,
                        task: task.clone(),
                    });
                }
                drop(state);
                post(task);
                state = shared.state.lock().unwrap();
            }
            Some(top) => {
                let wait = top.deadline - now;
                let (guard, _) = shared.cond.wait_timeout(state, wait).unwrap();
                state = guard;
            }
            None => {
                state = shared.cond.wait(state).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::function_task;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_delayed_fire() {
        let (tx, rx) = mpsc::channel();
        let timer = TimerThread::start(move |task| {
            task.run();
            tx.send(()).unwrap();
        });
        let (task, result) = function_task(0, || 3);
        let start = Instant::now();
        timer.schedule(task, Duration::from_millis(40), None);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(result.try_take(), Some(Ok(3)));
    }

    #[test]
    fn test_periodic_rearm() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let timer = TimerThread::start(move |task| task.run());

        struct Count(Arc<AtomicUsize>);
        impl crate::task::Task for Count {
            fn run(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        timer.schedule(Arc::new(Count(hits2)), Duration::from_millis(5), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(100));
        timer.shutdown();
        let seen = hits.load(Ordering::Relaxed);
        assert!(seen >= 3, "fired {} times", seen);
        // No more fires after shutdown
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(hits.load(Ordering::Relaxed), seen);
    }

    #[test]
    fn test_earliest_deadline_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let timer = TimerThread::start(move |task| task.run());
        for (id, delay) in [(1u32, 60u64), (2, 20), (3, 40)] {
            let order = Arc::clone(&order);
            let (task, _r) = function_task(0, move || order.lock().unwrap().push(id));
            timer.schedule(task, Duration::from_millis(delay), None);
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }
}
