//! Thread-safe blocking queue over a caller-chosen lock
//!
//! A singly-linked list of box-allocated nodes with `head`/`tail` pointers.
//! Every mutating operation is serialized by the lock policy `L`; blocking
//! pulls park the calling thread on a waiter list kept under the same lock.
//! Two-queue operations (`append`, `swap`) take both locks through
//! [`OrderedLock`], so opposite-order call sites cannot deadlock.

use core::cell::UnsafeCell;
use core::ptr;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::locks::{Lockable, OrderedLock, RawMutex};

struct QueueNode<T> {
    next: *mut QueueNode<T>,
    value: T,
}

struct Waiter {
    thread: Thread,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Waiter {
            thread: thread::current(),
        })
    }

    fn wake(&self) {
        // A stale unpark token only costs the puller one extra loop
        self.thread.unpark();
    }
}

struct QueueInner<T> {
    head: *mut QueueNode<T>,
    tail: *mut QueueNode<T>,
    closed: bool,
    waiters: Vec<Arc<Waiter>>,
}

impl<T> QueueInner<T> {
    const fn new() -> Self {
        QueueInner {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            closed: false,
            waiters: Vec::new(),
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.tail.is_null()
    }

    fn hook(&mut self, node: *mut QueueNode<T>) {
        if self.tail.is_null() {
            self.head = node;
        } else {
            // Safety: tail is a live node owned by this queue
            unsafe { (*self.tail).next = node };
        }
        self.tail = node;
    }

    fn unhook(&mut self) -> Option<Box<QueueNode<T>>> {
        if self.head.is_null() {
            return None;
        }
        // Safety: head was allocated by Box::into_raw in push
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(node)
    }

    fn take_one_waiter(&mut self) -> Option<Arc<Waiter>> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0))
        }
    }

    fn remove_waiter(&mut self, w: &Arc<Waiter>) {
        self.waiters.retain(|other| !Arc::ptr_eq(other, w));
    }
}

/// Thread-safe blocking queue
///
/// `L` selects the serialization policy: [`RawMutex`] (the default) or
/// [`crate::spinlock::RawSpinLock`] for short uncontended sections.
pub struct ConcurrentQueue<T, L: Lockable + Default = RawMutex> {
    lock: L,
    inner: UnsafeCell<QueueInner<T>>,
}

// Safety: `inner` is only touched while holding `lock`
unsafe impl<T: Send, L: Lockable + Default + Send> Send for ConcurrentQueue<T, L> {}
unsafe impl<T: Send, L: Lockable + Default + Sync> Sync for ConcurrentQueue<T, L> {}

impl<T, L: Lockable + Default> ConcurrentQueue<T, L> {
    pub fn new() -> Self {
        ConcurrentQueue {
            lock: L::default(),
            inner: UnsafeCell::new(QueueInner::new()),
        }
    }

    /// Reference to the internal lock, for callers composing wider
    /// critical sections with the `_unsafe` operations
    #[inline]
    pub fn underlying_lock(&self) -> &L {
        &self.lock
    }

    #[inline]
    fn inner(&self) -> &mut QueueInner<T> {
        // Safety: callers hold `lock` (checked by convention, see each site)
        unsafe { &mut *self.inner.get() }
    }

    /// Append `value`; fails once the queue is closed
    ///
    /// If the queue was empty, one blocked puller is woken.
    pub fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(QueueNode {
            next: ptr::null_mut(),
            value,
        }));

        self.lock.raw_lock();
        let inner = self.inner();
        if inner.closed {
            self.lock.raw_unlock();
            // Safety: node was never linked
            drop(unsafe { Box::from_raw(node) });
            return false;
        }
        let was_empty = inner.is_empty();
        inner.hook(node);
        let waiter = if was_empty { inner.take_one_waiter() } else { None };
        self.lock.raw_unlock();

        if let Some(w) = waiter {
            w.wake();
        }
        true
    }

    /// Remove the head element without blocking
    pub fn pull(&self) -> Option<T> {
        self.lock.raw_lock();
        let node = self.inner().unhook();
        self.lock.raw_unlock();
        node.map(|n| n.value)
    }

    /// Block until an element arrives or the queue closes
    ///
    /// Returns `None` only when the queue is closed and drained.
    pub fn wait_pull(&self) -> Option<T> {
        self.wait_pull_inner(None)
    }

    /// Bounded [`ConcurrentQueue::wait_pull`]; `None` when the wait expires
    pub fn wait_pull_for(&self, timeout: Duration) -> Option<T> {
        self.wait_pull_until(Instant::now() + timeout)
    }

    /// Deadline-bounded [`ConcurrentQueue::wait_pull`]
    pub fn wait_pull_until(&self, deadline: Instant) -> Option<T> {
        self.wait_pull_inner(Some(deadline))
    }

    fn wait_pull_inner(&self, deadline: Option<Instant>) -> Option<T> {
        let mut registered: Option<Arc<Waiter>> = None;

        self.lock.raw_lock();
        loop {
            let inner = self.inner();
            if let Some(node) = inner.unhook() {
                if let Some(w) = &registered {
                    inner.remove_waiter(w);
                }
                self.lock.raw_unlock();
                return Some(node.value);
            }
            if inner.closed {
                if let Some(w) = &registered {
                    inner.remove_waiter(w);
                }
                self.lock.raw_unlock();
                return None;
            }

            let timeout = match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        if let Some(w) = &registered {
                            inner.remove_waiter(w);
                        }
                        self.lock.raw_unlock();
                        return None;
                    }
                    Some(dl - now)
                }
                None => None,
            };

            let waiter = registered.get_or_insert_with(Waiter::new).clone();
            if !inner.waiters.iter().any(|w| Arc::ptr_eq(w, &waiter)) {
                inner.waiters.push(waiter.clone());
            }
            self.lock.raw_unlock();

            match timeout {
                Some(t) => thread::park_timeout(t),
                None => thread::park(),
            }

            self.lock.raw_lock();
        }
    }

    /// Close the queue: further pushes fail, blocked pullers drain and
    /// then observe closure. Idempotent.
    pub fn close(&self) {
        self.lock.raw_lock();
        let inner = self.inner();
        inner.closed = true;
        let waiters = core::mem::take(&mut inner.waiters);
        self.lock.raw_unlock();

        for w in waiters {
            w.wake();
        }
    }

    pub fn closed(&self) -> bool {
        self.lock.raw_lock();
        let closed = self.inner().closed;
        self.lock.raw_unlock();
        closed
    }

    pub fn empty(&self) -> bool {
        self.lock.raw_lock();
        let empty = self.inner().is_empty();
        self.lock.raw_unlock();
        empty
    }

    /// Drop all queued elements; destructors run outside the lock
    pub fn clear(&self) {
        self.lock.raw_lock();
        let inner = self.inner();
        let head = inner.head;
        inner.head = ptr::null_mut();
        inner.tail = ptr::null_mut();
        self.lock.raw_unlock();

        drop_chain(head);
    }

    /// Splice the whole content of `other` onto the back of `self`
    ///
    /// `other` is left empty. Both internal locks are taken in address
    /// order, so concurrent `a.append(b)` / `b.append(a)` cannot deadlock.
    pub fn append<L2: Lockable + Default>(&self, other: &ConcurrentQueue<T, L2>) {
        if ptr::eq(
            self as *const _ as *const u8,
            other as *const _ as *const u8,
        ) {
            return;
        }
        let _guard = OrderedLock::new(&self.lock, &other.lock);
        let src = other.inner();
        if src.is_empty() {
            return;
        }
        let dst = self.inner();
        let was_empty = dst.is_empty();
        if was_empty {
            dst.head = src.head;
        } else {
            // Safety: dst.tail is live while the lock is held
            unsafe { (*dst.tail).next = src.head };
        }
        dst.tail = src.tail;
        src.head = ptr::null_mut();
        src.tail = ptr::null_mut();

        if was_empty {
            if let Some(w) = dst.take_one_waiter() {
                w.wake();
            }
        }
    }

    /// Copy every element of `other` (any compatible element type) onto
    /// the back of `self`, leaving `other` untouched
    pub fn append_from<U, L2>(&self, other: &ConcurrentQueue<U, L2>)
    where
        U: Clone,
        T: From<U>,
        L2: Lockable + Default,
    {
        if ptr::eq(
            self as *const _ as *const u8,
            other as *const _ as *const u8,
        ) {
            return;
        }
        let _guard = OrderedLock::new(&self.lock, &other.lock);
        let src = other.inner();
        let dst = self.inner();
        let was_empty = dst.is_empty();

        let mut cur = src.head;
        while !cur.is_null() {
            // Safety: nodes are owned by `other`, whose lock we hold
            let value = unsafe { (*cur).value.clone() };
            let node = Box::into_raw(Box::new(QueueNode {
                next: ptr::null_mut(),
                value: T::from(value),
            }));
            dst.hook(node);
            cur = unsafe { (*cur).next };
        }

        if was_empty && !dst.is_empty() {
            if let Some(w) = dst.take_one_waiter() {
                w.wake();
            }
        }
    }

    /// Build a queue from the elements of `other` without consuming it
    pub fn from_queue<U, L2>(other: &ConcurrentQueue<U, L2>) -> Self
    where
        U: Clone,
        T: From<U>,
        L2: Lockable + Default,
    {
        let queue = Self::new();
        queue.append_from(other);
        queue
    }

    /// Exchange contents with `other` under both locks
    pub fn swap<L2: Lockable + Default>(&self, other: &ConcurrentQueue<T, L2>) {
        if ptr::eq(
            self as *const _ as *const u8,
            other as *const _ as *const u8,
        ) {
            return;
        }
        let _guard = OrderedLock::new(&self.lock, &other.lock);
        // Safety: both locks held
        unsafe { self.swap_unsafe(other) };
    }

    /// Exchange contents without taking either lock
    ///
    /// # Safety
    ///
    /// The caller must hold both internal locks (for instance through an
    /// adopted [`OrderedLock`]).
    pub unsafe fn swap_unsafe<L2: Lockable + Default>(&self, other: &ConcurrentQueue<T, L2>) {
        let a = &mut *self.inner.get();
        let b = &mut *other.inner.get();
        core::mem::swap(&mut a.head, &mut b.head);
        core::mem::swap(&mut a.tail, &mut b.tail);
    }

    /// Append without taking the lock
    ///
    /// # Safety
    ///
    /// The caller must hold the internal lock.
    pub unsafe fn push_unsafe(&self, value: T) -> bool {
        let inner = &mut *self.inner.get();
        if inner.closed {
            return false;
        }
        let node = Box::into_raw(Box::new(QueueNode {
            next: ptr::null_mut(),
            value,
        }));
        inner.hook(node);
        true
    }

    /// Pull without taking the lock
    ///
    /// # Safety
    ///
    /// The caller must hold the internal lock.
    pub unsafe fn pull_unsafe(&self) -> Option<T> {
        (*self.inner.get()).unhook().map(|n| n.value)
    }
}

impl<T, L: Lockable + Default> Default for ConcurrentQueue<T, L> {
    fn default() -> Self {
        ConcurrentQueue::new()
    }
}

impl<T, L: Lockable + Default> Drop for ConcurrentQueue<T, L> {
    fn drop(&mut self) {
        drop_chain(self.inner.get_mut().head);
    }
}

fn drop_chain<T>(mut cur: *mut QueueNode<T>) {
    while !cur.is_null() {
        // Safety: every linked node came from Box::into_raw
        let node = unsafe { Box::from_raw(cur) };
        cur = node.next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::RawSpinLock;
    use std::sync::Arc;

    #[test]
    fn test_push_pull_order() {
        let q: ConcurrentQueue<i32> = ConcurrentQueue::new();
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pull(), Some(1));
        assert_eq!(q.pull(), Some(2));
        assert_eq!(q.pull(), Some(3));
        assert_eq!(q.pull(), None);
    }

    #[test]
    fn test_pull_empty_closed() {
        let q: ConcurrentQueue<i32> = ConcurrentQueue::new();
        q.close();
        assert_eq!(q.pull(), None);
        assert!(!q.push(7));
        assert!(q.closed());
        // Idempotent
        q.close();
        assert!(q.closed());
    }

    #[test]
    fn test_close_drains_before_reporting() {
        let q: ConcurrentQueue<i32> = ConcurrentQueue::new();
        q.push(1);
        q.close();
        assert_eq!(q.wait_pull(), Some(1));
        assert_eq!(q.wait_pull(), None);
    }

    #[test]
    fn test_wait_pull_blocks_until_push() {
        let q: Arc<ConcurrentQueue<i32>> = Arc::new(ConcurrentQueue::new());
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.wait_pull());
        std::thread::sleep(Duration::from_millis(50));
        q.push(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn test_wait_pull_for_zero_like_pull() {
        let q: ConcurrentQueue<i32> = ConcurrentQueue::new();
        q.push(9);
        assert_eq!(q.wait_pull_for(Duration::ZERO), Some(9));
        assert_eq!(q.wait_pull_for(Duration::ZERO), None);
    }

    #[test]
    fn test_wait_pull_for_expires() {
        let q: ConcurrentQueue<i32> = ConcurrentQueue::new();
        let start = Instant::now();
        assert_eq!(q.wait_pull_for(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let q: Arc<ConcurrentQueue<i32>> = Arc::new(ConcurrentQueue::new());
        let mut handles = vec![];
        for _ in 0..3 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || q.wait_pull()));
        }
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        for h in handles {
            assert_eq!(h.join().unwrap(), None);
        }
    }

    #[test]
    fn test_append_splices_and_drains() {
        let a: ConcurrentQueue<i32> = ConcurrentQueue::new();
        let b: ConcurrentQueue<i32> = ConcurrentQueue::new();
        a.push(1);
        b.push(2);
        b.push(3);
        a.append(&b);
        assert!(b.empty());
        assert_eq!(a.pull(), Some(1));
        assert_eq!(a.pull(), Some(2));
        assert_eq!(a.pull(), Some(3));
    }

    #[test]
    fn test_append_across_lock_types() {
        let a: ConcurrentQueue<i32, RawSpinLock> = ConcurrentQueue::new();
        let b: ConcurrentQueue<i32> = ConcurrentQueue::new();
        b.push(5);
        a.append(&b);
        assert_eq!(a.pull(), Some(5));
        assert!(b.empty());
    }

    #[test]
    fn test_append_from_copies() {
        let a: ConcurrentQueue<i64> = ConcurrentQueue::new();
        let b: ConcurrentQueue<i32> = ConcurrentQueue::new();
        b.push(1);
        b.push(2);
        a.append_from(&b);
        // Source untouched
        assert_eq!(b.pull(), Some(1));
        assert_eq!(b.pull(), Some(2));
        assert_eq!(a.pull(), Some(1));
        assert_eq!(a.pull(), Some(2));
    }

    #[test]
    fn test_from_queue_converts() {
        let src: ConcurrentQueue<i32> = ConcurrentQueue::new();
        src.push(7);
        let dst: ConcurrentQueue<i64> = ConcurrentQueue::from_queue(&src);
        assert_eq!(dst.pull(), Some(7));
        assert_eq!(src.pull(), Some(7));
    }

    #[test]
    fn test_swap() {
        let a: ConcurrentQueue<i32> = ConcurrentQueue::new();
        let b: ConcurrentQueue<i32> = ConcurrentQueue::new();
        a.push(1);
        b.push(2);
        a.swap(&b);
        assert_eq!(a.pull(), Some(2));
        assert_eq!(b.pull(), Some(1));
    }

    #[test]
    fn test_unsafe_ops_under_held_lock() {
        let q: ConcurrentQueue<i32> = ConcurrentQueue::new();
        q.underlying_lock().raw_lock();
        unsafe {
            assert!(q.push_unsafe(11));
            assert_eq!(q.pull_unsafe(), Some(11));
        }
        q.underlying_lock().raw_unlock();
    }

    #[test]
    fn test_clear() {
        let q: ConcurrentQueue<String> = ConcurrentQueue::new();
        q.push("a".into());
        q.push("b".into());
        q.clear();
        assert!(q.empty());
        assert_eq!(q.pull(), None);
    }

    #[test]
    fn test_producers_consumers_multiset() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 20_000;

        let q: Arc<ConcurrentQueue<u64>> = Arc::new(ConcurrentQueue::new());
        let mut handles = vec![];

        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    assert!(q.push(p * PER_PRODUCER + i));
                }
            }));
        }

        let mut consumers = vec![];
        for _ in 0..CONSUMERS {
            let q = Arc::clone(&q);
            consumers.push(std::thread::spawn(move || {
                let mut sum = 0u64;
                while let Some(v) = q.wait_pull() {
                    sum += v;
                }
                sum
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        q.close();

        let total: u64 = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        let n = PRODUCERS * PER_PRODUCER;
        assert_eq!(total, n * (n - 1) / 2);
    }

    #[test]
    fn test_per_producer_order_preserved() {
        let q: Arc<ConcurrentQueue<(u8, u32)>> = Arc::new(ConcurrentQueue::new());
        let mut producers = vec![];
        for p in 0..2u8 {
            let q = Arc::clone(&q);
            producers.push(std::thread::spawn(move || {
                for i in 0..5_000u32 {
                    q.push((p, i));
                }
            }));
        }
        for h in producers {
            h.join().unwrap();
        }
        q.close();

        let mut last = [0u32; 2];
        let mut seen = [0u32; 2];
        while let Some((p, i)) = q.pull() {
            let p = p as usize;
            if seen[p] > 0 {
                assert!(i > last[p], "producer order violated");
            }
            last[p] = i;
            seen[p] += 1;
        }
        assert_eq!(seen, [5_000, 5_000]);
    }
}
