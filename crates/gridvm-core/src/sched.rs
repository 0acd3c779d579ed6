//! Pluggable task schedulers
//!
//! One scheduler type with three ordering policies behind it: FIFO, LIFO
//! and max-priority-first (insertion order breaks priority ties). Workers
//! block in [`Scheduler::schedule`]; the contender count tells `push`
//! whether signalling is worth it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::task::TaskRef;

/// Ordering policy of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Insertion order
    Fifo,
    /// Reverse insertion order
    Lifo,
    /// Max priority first, insertion order within equal priority
    Prio,
}

struct PrioEntry {
    task: TaskRef,
    prio: i32,
    seq: u64,
}

impl PartialEq for PrioEntry {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio && self.seq == other.seq
    }
}

impl Eq for PrioEntry {}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap on priority; earlier sequence wins ties
        self.prio
            .cmp(&other.prio)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum TaskContainer {
    Fifo(VecDeque<TaskRef>),
    Lifo(VecDeque<TaskRef>),
    Prio(BinaryHeap<PrioEntry>),
}

impl TaskContainer {
    fn new(kind: SchedulerKind) -> Self {
        match kind {
            SchedulerKind::Fifo => TaskContainer::Fifo(VecDeque::new()),
            SchedulerKind::Lifo => TaskContainer::Lifo(VecDeque::new()),
            SchedulerKind::Prio => TaskContainer::Prio(BinaryHeap::new()),
        }
    }

    fn push(&mut self, task: TaskRef, seq: u64) {
        match self {
            TaskContainer::Fifo(q) => q.push_back(task),
            TaskContainer::Lifo(q) => q.push_front(task),
            TaskContainer::Prio(heap) => {
                let prio = task.priority();
                heap.push(PrioEntry { task, prio, seq });
            }
        }
    }

    fn pop(&mut self) -> Option<TaskRef> {
        match self {
            TaskContainer::Fifo(q) | TaskContainer::Lifo(q) => q.pop_front(),
            TaskContainer::Prio(heap) => heap.pop().map(|e| e.task),
        }
    }

    fn len(&self) -> usize {
        match self {
            TaskContainer::Fifo(q) | TaskContainer::Lifo(q) => q.len(),
            TaskContainer::Prio(heap) => heap.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> SchedulerKind {
        match self {
            TaskContainer::Fifo(_) => SchedulerKind::Fifo,
            TaskContainer::Lifo(_) => SchedulerKind::Lifo,
            TaskContainer::Prio(_) => SchedulerKind::Prio,
        }
    }
}

struct SchedState {
    tasks: TaskContainer,
    contenders: usize,
    stopped: bool,
    next_seq: u64,
}

/// A queue of tasks with a wait condition for idle workers
pub struct Scheduler {
    state: Mutex<SchedState>,
    cond: Condvar,
}

impl Scheduler {
    pub fn new(kind: SchedulerKind) -> Self {
        Scheduler {
            state: Mutex::new(SchedState {
                tasks: TaskContainer::new(kind),
                contenders: 0,
                stopped: false,
                next_seq: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.state.lock().unwrap().tasks.kind()
    }

    /// Enqueue a task, waking one contender if any is blocked
    pub fn push(&self, task: TaskRef) {
        let mut st = self.state.lock().unwrap();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.tasks.push(task, seq);
        if st.contenders > 0 {
            self.cond.notify_one();
        }
    }

    /// Take the front task, waiting up to `max_wait` for one to appear
    ///
    /// Returns early when the scheduler is stopped; whatever is queued at
    /// wake-up is still handed out so queues drain during shutdown.
    pub fn schedule(&self, max_wait: Duration) -> Option<TaskRef> {
        let mut st = self.state.lock().unwrap();
        st.contenders += 1;

        let deadline = Instant::now() + max_wait;
        while st.tasks.is_empty() && !st.stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, timed_out) = self.cond.wait_timeout(st, deadline - now).unwrap();
            st = guard;
            if timed_out.timed_out() {
                break;
            }
        }

        st.contenders -= 1;
        st.tasks.pop()
    }

    /// Non-waiting [`Scheduler::schedule`]
    pub fn try_schedule(&self) -> Option<TaskRef> {
        let mut st = self.state.lock().unwrap();
        st.tasks.pop()
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn empty(&self) -> bool {
        self.state.lock().unwrap().tasks.is_empty()
    }

    /// Discard all queued tasks; their destructors run outside the lock
    pub fn clear(&self) {
        let victim = {
            let mut st = self.state.lock().unwrap();
            let kind = st.tasks.kind();
            core::mem::replace(&mut st.tasks, TaskContainer::new(kind))
        };
        drop(victim);
    }

    /// Stop the scheduler and wake every contender
    pub fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.stopped = true;
        drop(st);
        self.cond.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::function_task;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn marker(order: &Arc<Mutex<Vec<i32>>>, id: i32, prio: i32) -> TaskRef {
        let order = Arc::clone(order);
        let (task, _result) = function_task(prio, move || {
            order.lock().unwrap().push(id);
        });
        task
    }

    #[test]
    fn test_fifo_order() {
        let sched = Scheduler::new(SchedulerKind::Fifo);
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            sched.push(marker(&order, id, 0));
        }
        while let Some(t) = sched.try_schedule() {
            t.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_lifo_order() {
        let sched = Scheduler::new(SchedulerKind::Lifo);
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            sched.push(marker(&order, id, 0));
        }
        while let Some(t) = sched.try_schedule() {
            t.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_prio_order_with_ties() {
        let sched = Scheduler::new(SchedulerKind::Prio);
        let order = Arc::new(Mutex::new(Vec::new()));
        sched.push(marker(&order, 1, 1));
        sched.push(marker(&order, 2, 3));
        sched.push(marker(&order, 3, 2));
        sched.push(marker(&order, 4, 3)); // tie with 2, inserted later
        while let Some(t) = sched.try_schedule() {
            t.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_schedule_timeout_empty() {
        let sched = Scheduler::new(SchedulerKind::Fifo);
        let start = Instant::now();
        assert!(sched.schedule(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_push_wakes_contender() {
        let sched = Arc::new(Scheduler::new(SchedulerKind::Fifo));
        let sched2 = Arc::clone(&sched);
        let handle =
            std::thread::spawn(move || sched2.schedule(Duration::from_secs(5)).is_some());
        std::thread::sleep(Duration::from_millis(50));
        let (task, _r) = function_task(0, || ());
        sched.push(task);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_stop_wakes_contenders() {
        let sched = Arc::new(Scheduler::new(SchedulerKind::Fifo));
        let sched2 = Arc::clone(&sched);
        let handle =
            std::thread::spawn(move || sched2.schedule(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        sched.stop();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn test_clear_empties() {
        let sched = Scheduler::new(SchedulerKind::Prio);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = Arc::clone(&hits);
            let (task, _r) = function_task(0, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
            sched.push(task);
        }
        assert_eq!(sched.size(), 4);
        sched.clear();
        assert!(sched.empty());
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }
}
