//! Lock policy trait and ordered two-lock acquisition
//!
//! [`Lockable`] is the policy hook used by the concurrent queue: any type
//! exposing raw `lock`/`unlock` qualifies. [`OrderedLock`] acquires two
//! lockables in ascending address order regardless of the argument order,
//! which turns every chain of pairwise acquisitions into a strict total
//! order and therefore keeps them acyclic.

use core::cell::UnsafeCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{LockError, LockResult};
use crate::spinlock::RawSpinLock;

/// A lock usable through raw `lock`/`unlock` calls
///
/// Unlike RAII guards, implementations hand ownership tracking to the
/// caller. That is what allows two locks of different types to be taken
/// and released in a caller-chosen (address) order.
pub trait Lockable {
    fn raw_lock(&self);
    fn raw_unlock(&self);
}

impl Lockable for RawSpinLock {
    #[inline]
    fn raw_lock(&self) {
        self.lock();
    }

    #[inline]
    fn raw_unlock(&self) {
        self.unlock();
    }
}

/// A `std::sync::Mutex` adapted to the raw [`Lockable`] surface
///
/// The guard returned by `Mutex::lock` is stashed inside the structure so
/// that a later `raw_unlock` can release it. Poisoning is ignored: a
/// panicking task does not invalidate queue contents.
pub struct RawMutex {
    inner: Mutex<()>,
    // Holds the guard between raw_lock and raw_unlock. Written only by the
    // thread that currently owns `inner`.
    guard: UnsafeCell<Option<MutexGuard<'static, ()>>>,
}

// Safety: `guard` is only accessed by the lock owner, serialized by `inner`
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub fn new() -> Self {
        RawMutex {
            inner: Mutex::new(()),
            guard: UnsafeCell::new(None),
        }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        RawMutex::new()
    }
}

impl Lockable for RawMutex {
    fn raw_lock(&self) {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Safety: we own `inner`, so no other thread touches the stash.
        // The lifetime is erased; the guard never outlives `self` because
        // raw_unlock drops it and Drop clears any leftover.
        let guard: MutexGuard<'static, ()> = unsafe { core::mem::transmute(guard) };
        unsafe { *self.guard.get() = Some(guard) };
    }

    fn raw_unlock(&self) {
        // Safety: only the owner reaches this; taking the stash releases it
        let released = unsafe { (*self.guard.get()).take() };
        debug_assert!(released.is_some(), "raw_unlock without raw_lock");
        drop(released);
    }
}

/// RAII guard over two lockables, acquired in ascending address order
///
/// The constructors mirror the usual tag conventions: [`OrderedLock::new`]
/// locks immediately, [`OrderedLock::deferred`] leaves both unlocked and
/// [`OrderedLock::adopted`] takes over locks the caller already holds.
pub struct OrderedLock<'a, A: Lockable, B: Lockable> {
    pair: Option<(&'a A, &'a B)>,
    locked: bool,
}

impl<'a, A: Lockable, B: Lockable> OrderedLock<'a, A, B> {
    /// Acquire both locks in address order
    pub fn new(first: &'a A, second: &'a B) -> Self {
        let mut lock = Self::deferred(first, second);
        // A fresh deferred guard can always be locked
        lock.lock().expect("deferred ordered lock");
        lock
    }

    /// Construct without locking
    pub fn deferred(first: &'a A, second: &'a B) -> Self {
        OrderedLock {
            pair: Some((first, second)),
            locked: false,
        }
    }

    /// Adopt locks the caller has already acquired
    pub fn adopted(first: &'a A, second: &'a B) -> Self {
        OrderedLock {
            pair: Some((first, second)),
            locked: true,
        }
    }

    /// Acquire both locks in ascending address order
    ///
    /// Fails with [`LockError::WouldDeadlock`] when already owned, and
    /// with [`LockError::NotPermitted`] after [`OrderedLock::release`].
    pub fn lock(&mut self) -> LockResult<()> {
        if self.locked {
            return Err(LockError::WouldDeadlock);
        }
        let (a, b) = self.pair.ok_or(LockError::NotPermitted)?;
        let (pa, pb) = (a as *const A as usize, b as *const B as usize);
        debug_assert_ne!(pa, pb, "ordered lock over one lock");
        if pa < pb {
            a.raw_lock();
            b.raw_lock();
        } else {
            b.raw_lock();
            a.raw_lock();
        }
        self.locked = true;
        Ok(())
    }

    /// Release both locks, in the same address order they were taken
    pub fn unlock(&mut self) -> LockResult<()> {
        if !self.locked {
            return Err(LockError::NotPermitted);
        }
        let (a, b) = self.pair.ok_or(LockError::NotPermitted)?;
        let (pa, pb) = (a as *const A as usize, b as *const B as usize);
        if pa < pb {
            a.raw_unlock();
            b.raw_unlock();
        } else {
            b.raw_unlock();
            a.raw_unlock();
        }
        self.locked = false;
        Ok(())
    }

    /// Give up ownership without unlocking; returns the lockables
    ///
    /// The caller becomes responsible for releasing them.
    pub fn release(&mut self) -> Option<(&'a A, &'a B)> {
        self.locked = false;
        self.pair.take()
    }

    /// Whether the guard currently owns both locks
    #[inline]
    pub fn owns_lock(&self) -> bool {
        self.locked
    }
}

impl<'a, A: Lockable, B: Lockable> Drop for OrderedLock<'a, A, B> {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ordered_lock_basic() {
        let a = RawSpinLock::new();
        let b = RawSpinLock::new();
        {
            let guard = OrderedLock::new(&a, &b);
            assert!(guard.owns_lock());
            assert!(!a.try_lock(1));
            assert!(!b.try_lock(1));
        }
        assert!(a.try_lock(1));
        assert!(b.try_lock(1));
        a.unlock();
        b.unlock();
    }

    #[test]
    fn test_double_lock_fails() {
        let a = RawSpinLock::new();
        let b = RawSpinLock::new();
        let mut guard = OrderedLock::new(&a, &b);
        assert_eq!(guard.lock(), Err(LockError::WouldDeadlock));
    }

    #[test]
    fn test_unlock_unowned_fails() {
        let a = RawSpinLock::new();
        let b = RawSpinLock::new();
        let mut guard = OrderedLock::deferred(&a, &b);
        assert_eq!(guard.unlock(), Err(LockError::NotPermitted));
    }

    #[test]
    fn test_release_transfers_ownership() {
        let a = RawSpinLock::new();
        let b = RawSpinLock::new();
        let mut guard = OrderedLock::new(&a, &b);
        let (ra, rb) = guard.release().unwrap();
        drop(guard);
        // Still locked: drop must not have released them
        assert!(!a.try_lock(1));
        ra.raw_unlock();
        rb.raw_unlock();
        assert!(a.try_lock(1));
        a.unlock();
    }

    #[test]
    fn test_raw_mutex_lock_unlock() {
        let m = RawMutex::new();
        m.raw_lock();
        m.raw_unlock();
        m.raw_lock();
        m.raw_unlock();
    }

    #[test]
    fn test_opposite_order_no_deadlock() {
        // Two threads repeatedly locking the same pair in opposite
        // argument order must never deadlock.
        const ITERS: usize = 100_000;
        let a = Arc::new(RawSpinLock::new());
        let b = Arc::new(RawSpinLock::new());
        let acquisitions = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for flip in [false, true] {
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            let acquisitions = Arc::clone(&acquisitions);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERS {
                    if flip {
                        let _guard = OrderedLock::new(&*b, &*a);
                        acquisitions.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let _guard = OrderedLock::new(&*a, &*b);
                        acquisitions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(acquisitions.load(Ordering::Relaxed), 2 * ITERS);
    }
}
