//! User-space spinlock with tunable back-off
//!
//! The raw lock retries a test-and-set with acquire ordering. Between
//! attempts it either burns a fixed number of revolutions or sleeps for a
//! run-time tunable number of microseconds. The sleep duration is atomic
//! and may be adjusted at any time, including while other threads contend.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Busy-loop revolutions used when the sleep duration is zero
const DELAY_REVS: u32 = 1000;

/// A raw spinlock without an associated value
///
/// Used directly where a lock policy is chosen by the caller (see
/// [`crate::locks::Lockable`]) and as the engine behind [`SpinLock`].
pub struct RawSpinLock {
    flag: AtomicBool,
    sleep_dur_usecs: AtomicU32,
}

impl RawSpinLock {
    /// Create an unlocked spinlock with busy-loop back-off
    #[inline]
    pub const fn new() -> Self {
        Self::with_sleep_dur(0)
    }

    /// Create an unlocked spinlock sleeping `usecs` between attempts
    #[inline]
    pub const fn with_sleep_dur(usecs: u32) -> Self {
        RawSpinLock {
            flag: AtomicBool::new(false),
            sleep_dur_usecs: AtomicU32::new(usecs),
        }
    }

    fn sleep(&self) {
        let usecs = self.sleep_dur_usecs.load(Ordering::Acquire);
        if usecs != 0 {
            std::thread::sleep(Duration::from_micros(u64::from(usecs)));
        } else {
            for _ in 0..DELAY_REVS {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock, backing off between failed attempts
    pub fn lock(&self) {
        while self.flag.swap(true, Ordering::Acquire) {
            self.sleep();
        }
    }

    /// Attempt the lock up to `attempts` times
    ///
    /// Returns `true` on acquisition. `attempts` must be non-zero.
    pub fn try_lock(&self, mut attempts: u32) -> bool {
        debug_assert!(attempts > 0);
        while self.flag.swap(true, Ordering::Acquire) {
            attempts -= 1;
            if attempts == 0 {
                return false;
            }
            self.sleep();
        }
        true
    }

    /// Release the lock
    #[inline]
    pub fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Current back-off sleep duration in microseconds
    #[inline]
    pub fn sleep_dur(&self) -> u32 {
        self.sleep_dur_usecs.load(Ordering::Relaxed)
    }

    /// Set the back-off sleep duration in microseconds (0 = busy loop)
    #[inline]
    pub fn set_sleep_dur(&self, usecs: u32) {
        self.sleep_dur_usecs.store(usecs, Ordering::Release);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        RawSpinLock::new()
    }
}

/// A value guarded by a [`RawSpinLock`]
///
/// Intended for short critical sections inside the engine; blocking
/// consumers should prefer a mutex-backed policy.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: the raw lock serializes all access to `data`
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spinlock containing `value`
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is available
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Single acquisition attempt
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock(1) {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spinlock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
