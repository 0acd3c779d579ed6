//! Reactor pool: single-threaded event loops handed out round-robin
//!
//! A reactor is a job queue pumped one job at a time. Network sessions
//! and the acceptor are self-re-posting jobs, so any thread calling
//! `run_one` in a loop multiplexes every session assigned to that
//! reactor. The pool assigns reactors round-robin behind a mutex-guarded
//! counter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// Unit of reactor work
pub type Job = Box<dyn FnOnce() + Send>;

/// Queue capacity per reactor; overflow falls back to inline execution
const JOB_QUEUE_CAPACITY: usize = 16_384;

struct ReactorInner {
    jobs: ArrayQueue<Job>,
    idle: Mutex<()>,
    cond: Condvar,
    stopped: AtomicBool,
}

/// One single-threaded event loop
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> Self {
        Reactor {
            inner: Arc::new(ReactorInner {
                jobs: ArrayQueue::new(JOB_QUEUE_CAPACITY),
                idle: Mutex::new(()),
                cond: Condvar::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a job for the next `run_one`
    pub fn post(&self, job: Job) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Err(job) = self.inner.jobs.push(job) {
            // Queue saturated: run inline rather than drop the work
            tracing::warn!("reactor queue full, running job inline");
            job();
            return;
        }
        let _guard = self.inner.idle.lock().unwrap();
        self.inner.cond.notify_one();
    }

    /// Pump one job, waiting up to `max_wait` for one to arrive
    ///
    /// Returns `true` when a job ran.
    pub fn run_one(&self, max_wait: Duration) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        if let Some(job) = self.inner.jobs.pop() {
            job();
            return true;
        }
        if max_wait.is_zero() {
            return false;
        }

        {
            let guard = self.inner.idle.lock().unwrap();
            if self.inner.jobs.is_empty() && !self.inner.stopped.load(Ordering::Acquire) {
                let _ = self.inner.cond.wait_timeout(guard, max_wait).unwrap();
            }
        }

        match self.inner.jobs.pop() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Refuse further jobs and wake sleeping pumpers
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _guard = self.inner.idle.lock().unwrap();
        self.inner.cond.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.inner.jobs.len()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Reactor::new()
    }
}

/// A fixed set of reactors assigned round-robin
pub struct ReactorPool {
    reactors: Vec<Reactor>,
    next: Mutex<usize>,
}

impl ReactorPool {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        ReactorPool {
            reactors: (0..count).map(|_| Reactor::new()).collect(),
            next: Mutex::new(0),
        }
    }

    /// Round-robin pick
    pub fn next_reactor(&self) -> Reactor {
        let mut next = self.next.lock().unwrap();
        let reactor = self.reactors[*next].clone();
        *next = (*next + 1) % self.reactors.len();
        reactor
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    pub fn stop(&self) {
        for reactor in &self.reactors {
            reactor.stop();
        }
    }
}
