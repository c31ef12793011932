//! The shared physical stack
//!
//! Every coroutine on a thread executes on the same mmap'd region. Only the
//! live part of a suspended coroutine's stack is copied out to its own heap
//! buffer, so a parked coroutine costs as many bytes as it actually used.
//!
//! ```text
//!  base                                                       top
//!  |  guard (PROT_NONE)  |  usable stack  ...  <- grows down  |
//! ```
//!
//! Running past the usable region faults on the guard page, which kills the
//! process.

use costack_core::constants::GUARD_SIZE;
use costack_core::error::StackError;
use costack_core::{kdebug, kerror};
use std::cell::OnceCell;

/// One thread's shared stack region
pub struct SharedStack {
    base: *mut u8,
    total_size: usize,
    stack_size: usize,
}

/// Copyable view of a shared stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// One past the highest usable byte
    pub top: usize,
    /// Usable bytes below `top`
    pub size: usize,
}

impl StackBounds {
    #[inline]
    pub fn bottom(&self) -> usize {
        self.top - self.size
    }

    /// Check if `sp` points into the usable region
    #[inline]
    pub fn contains(&self, sp: usize) -> bool {
        sp >= self.bottom() && sp <= self.top
    }
}

impl SharedStack {
    /// Map `stack_size` usable bytes (rounded up to whole pages) plus a guard page
    pub fn new(stack_size: usize) -> Result<Self, StackError> {
        let page = page_size();
        let stack_size = stack_size.div_ceil(page) * page;
        let total_size = stack_size + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            kerror!("shared stack mmap of {} bytes failed", total_size);
            return Err(StackError::AllocationFailed);
        }

        // Guard page at the low end
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total_size) };
            return Err(StackError::ProtectionFailed);
        }

        kdebug!("shared stack mapped at {:p}, {} usable bytes", base, stack_size);
        Ok(Self {
            base: base as *mut u8,
            total_size,
            stack_size,
        })
    }

    #[inline]
    pub fn bounds(&self) -> StackBounds {
        StackBounds {
            top: self.base as usize + self.total_size,
            size: self.stack_size,
        }
    }
}

impl Drop for SharedStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_size);
        }
    }
}

thread_local! {
    static SHARED_STACK: OnceCell<SharedStack> = const { OnceCell::new() };
}

/// Map this thread's shared stack with an explicit size
///
/// Optional; the first coroutine resume maps a default-sized stack. Returns
/// the existing bounds if the stack is already mapped.
pub fn init_shared_stack(stack_size: usize) -> Result<StackBounds, StackError> {
    SHARED_STACK.with(|cell| {
        if let Some(stack) = cell.get() {
            return Ok(stack.bounds());
        }
        let stack = SharedStack::new(stack_size)?;
        let bounds = stack.bounds();
        let _ = cell.set(stack);
        Ok(bounds)
    })
}

/// Bounds of this thread's shared stack, mapping it on first use
pub fn shared_stack() -> Result<StackBounds, StackError> {
    if let Some(bounds) = SHARED_STACK.with(|cell| cell.get().map(SharedStack::bounds)) {
        return Ok(bounds);
    }
    init_shared_stack(crate::config::LoopConfig::from_env().stack_size)
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}
