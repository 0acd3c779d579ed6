//! Guarded coroutine stacks via mmap
//!
//! Each stack is rounded up to whole pages plus one extra page at the low
//! end protected `PROT_NONE`, so an overflow faults instead of corrupting
//! the neighbouring allocation. Stack size limits come from
//! `RLIMIT_STACK`; an unbound limit reports `None`.

use std::sync::OnceLock;

/// System page size, cached after the first query
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

fn page_count(memsize: usize) -> usize {
    memsize.div_ceil(page_size())
}

fn stack_rlimit_max() -> libc::rlim_t {
    static LIMIT: OnceLock<libc::rlim_t> = OnceLock::new();
    *LIMIT.get_or_init(|| {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let result = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };
        debug_assert_eq!(result, 0);
        limit.rlim_max
    })
}

/// Whether the hard stack limit is unbounded
pub fn is_stack_unbound() -> bool {
    stack_rlimit_max() == libc::RLIM_INFINITY
}

/// Smallest stack this module will allocate
pub fn minimum_stack_size() -> usize {
    libc::MINSIGSTKSZ + 16
}

/// Hard upper bound from `RLIMIT_STACK`, when one exists
pub fn maximum_stack_size() -> Option<usize> {
    if is_stack_unbound() {
        None
    } else {
        Some(stack_rlimit_max() as usize)
    }
}

/// Default coroutine stack size: eight minimum stacks, clamped to the
/// hard limit when one exists
pub fn default_stack_size() -> usize {
    let size = 8 * minimum_stack_size();
    match maximum_stack_size() {
        Some(max) => size.min(max),
        None => size,
    }
}

/// An owned, guard-paged stack
///
/// `top` is the high end of the usable region, which is where a
/// descending stack starts.
pub struct Stack {
    size: usize,
    top: *mut u8,
}

// Safety: the mapping is exclusively owned and only handed to one
// coroutine at a time
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack of at least `stack_size` usable bytes
    ///
    /// Stack exhaustion of the *allocator* is fatal: there is no sane way
    /// to run a coroutine without its stack.
    pub fn allocate(stack_size: usize) -> Stack {
        let stack_size = stack_size.max(minimum_stack_size());

        // One extra page for the guard at the low end
        let pages = page_count(stack_size) + 1;
        let total = pages * page_size();

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!("coroutine stack allocation of {} bytes failed", total);
        }

        // The first page (last one reached by a descending stack) traps
        let result = unsafe { libc::mprotect(base, page_size(), libc::PROT_NONE) };
        if result != 0 {
            unsafe { libc::munmap(base, total) };
            panic!("guard page protection failed");
        }

        Stack {
            size: total,
            top: unsafe { (base as *mut u8).add(total) },
        }
    }

    /// High end of the stack; 16-byte aligned because mappings are
    /// page aligned
    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.top
    }

    /// Total mapped size, guard page included
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let base = unsafe { self.top.sub(self.size) };
        unsafe { libc::munmap(base as *mut libc::c_void, self.size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_size_bounds() {
        assert!(minimum_stack_size() > 0);
        assert!(default_stack_size() >= minimum_stack_size());
        if let Some(max) = maximum_stack_size() {
            assert!(default_stack_size() <= max);
        }
    }

    #[test]
    fn test_allocate_and_write() {
        let stack = Stack::allocate(default_stack_size());
        assert_eq!(stack.top() as usize % 16, 0);
        assert!(stack.size() > default_stack_size());
        // The usable region below the top must be writable
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }

    #[test]
    fn test_rounds_up_tiny_requests() {
        let stack = Stack::allocate(1);
        assert!(stack.size() >= minimum_stack_size());
    }
}
