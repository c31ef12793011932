//! Stackful coroutines over a shared stack
//!
//! A coroutine runs on the thread's shared stack (see `stack`). When it
//! yields, the resumer copies the bytes between the coroutine's saved stack
//! pointer and the top of the shared stack into the coroutine's own buffer;
//! before switching back in, those bytes are copied back to the same
//! addresses. Pointers into a coroutine's stack therefore stay valid across
//! yields, but only while the coroutine itself is running.
//!
//! ```text
//!   resume()                         coroutine body
//!   --------                         --------------
//!   restore saved bytes
//!   switch_context(resume, exec) --> runs ...
//!                                    yield_now()
//!   <-- switch_context(exec, resume)
//!   save [sp, top) to buffer
//! ```
//!
//! Rules enforced with panics:
//! - only `Ready`/`Suspended` coroutines can be resumed
//! - `resume()` cannot be called from inside a coroutine
//! - `yield_now()` must be called from inside a coroutine

use crate::arch::{self, Context};
use crate::event_loop::EventLoop;
use crate::stack::{self, StackBounds};
use crate::timer::TimerId;
use crate::tls;
use costack_core::error::StackError;
use costack_core::id::CoroutineId;
use costack_core::state::CoroutineState;
use costack_core::{kdebug, kerror, ktrace};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

type Body = Box<dyn FnOnce()>;

/// A suspendable unit of execution
pub struct Coroutine {
    id: CoroutineId,
    state: Cell<CoroutineState>,
    body: Cell<Option<Body>>,

    /// Where the coroutine continues on the next resume
    exec_point: UnsafeCell<Context>,

    /// Where control returns when the coroutine yields or finishes
    resume_point: UnsafeCell<Context>,

    /// Live bytes of the coroutine's stack while it is suspended
    saved_stack: UnsafeCell<Vec<u8>>,

    timed_out: Cell<bool>,
    pending_timeout: RefCell<Option<(Weak<EventLoop>, TimerId)>>,
    self_ref: Weak<Coroutine>,
}

impl Coroutine {
    /// Create a Ready coroutine that will run `body` on its first resume
    pub fn new<F>(body: F) -> Rc<Self>
    where
        F: FnOnce() + 'static,
    {
        Rc::new_cyclic(|weak| Coroutine {
            id: CoroutineId::next(),
            state: Cell::new(CoroutineState::Ready),
            body: Cell::new(Some(Box::new(body))),
            exec_point: UnsafeCell::new(Context::default()),
            resume_point: UnsafeCell::new(Context::default()),
            saved_stack: UnsafeCell::new(Vec::new()),
            timed_out: Cell::new(false),
            pending_timeout: RefCell::new(None),
            self_ref: weak.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        self.state.get()
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state.get().is_dead()
    }

    /// Whether the last `yield_with_timeout` was ended by its timer
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.timed_out.get()
    }

    /// Bytes currently parked in the save buffer
    pub fn saved_stack_len(&self) -> usize {
        unsafe { (*self.saved_stack.get()).len() }
    }

    /// Switch into the coroutine until it yields or finishes
    ///
    /// Cancels any timeout armed by `yield_with_timeout`, so a coroutine
    /// woken by I/O is never woken again by its stale timer.
    ///
    /// # Panics
    ///
    /// If the coroutine is Running or Dead, if another coroutine is running
    /// on this thread, or if the shared stack cannot be mapped.
    pub fn resume(&self) {
        if tls::in_coroutine() {
            panic!(
                "resume of {} from inside {}: nested resume is not allowed",
                self.id,
                tls::current_id()
            );
        }
        let state = self.state.get();
        if !state.is_resumable() {
            panic!("resume of {} in state {}", self.id, state);
        }

        self.cancel_timeout();

        let bounds = match stack::shared_stack() {
            Ok(b) => b,
            Err(e) => {
                kerror!("cannot map shared stack: {}", e);
                panic!("cannot map shared stack: {}", e);
            }
        };

        unsafe {
            if state == CoroutineState::Ready {
                arch::init_context(
                    self.exec_point.get(),
                    bounds.top,
                    coroutine_entry,
                    self as *const Coroutine as usize,
                );
            } else {
                self.restore_stack(bounds);
            }
        }

        ktrace!("resume {} ({})", self.id, state);
        self.state.set(CoroutineState::Running);
        tls::set_current(self, self.id);

        unsafe {
            arch::switch_context(self.resume_point.get(), self.exec_point.get());
        }

        tls::clear_current();

        match self.state.get() {
            CoroutineState::Suspended => {
                if let Err(e) = unsafe { self.save_stack(bounds) } {
                    kerror!("{}: {}", self.id, e);
                    panic!("{}: {}", self.id, e);
                }
            }
            CoroutineState::Dead => {
                kdebug!("{} finished", self.id);
                unsafe {
                    let saved = &mut *self.saved_stack.get();
                    saved.clear();
                    saved.shrink_to_fit();
                }
            }
            other => panic!("{} switched out in state {}", self.id, other),
        }
    }

    /// Copy the live part of the shared stack into the save buffer
    unsafe fn save_stack(&self, bounds: StackBounds) -> Result<(), StackError> {
        let sp = (*self.exec_point.get()).stack_pointer();
        if !bounds.contains(sp) {
            return Err(StackError::Overflow {
                used: bounds.top.wrapping_sub(sp),
                max: bounds.size,
            });
        }
        let used = bounds.top - sp;
        let saved = &mut *self.saved_stack.get();
        saved.clear();
        saved.extend_from_slice(std::slice::from_raw_parts(sp as *const u8, used));
        if saved.capacity() > 2 * used.max(256) {
            saved.shrink_to(used);
        }
        ktrace!("{} saved {} stack bytes", self.id, used);
        Ok(())
    }

    /// Copy the save buffer back to the same addresses on the shared stack
    unsafe fn restore_stack(&self, bounds: StackBounds) {
        let saved = &*self.saved_stack.get();
        let dst = (bounds.top - saved.len()) as *mut u8;
        std::ptr::copy_nonoverlapping(saved.as_ptr(), dst, saved.len());
    }

    fn cancel_timeout(&self) {
        let pending = self.pending_timeout.borrow_mut().take();
        if let Some((event_loop, timer)) = pending {
            if let Some(event_loop) = event_loop.upgrade() {
                event_loop.remove_timer(timer);
            }
        }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        self.cancel_timeout();
        if self.state.get() == CoroutineState::Suspended {
            // Values living on the saved stack are never dropped.
            kdebug!("{} dropped while suspended", self.id);
        }
    }
}

/// Runs on the shared stack; `arg` is the `*const Coroutine` being resumed
extern "C" fn coroutine_entry(arg: usize) {
    let co = arg as *const Coroutine;
    unsafe {
        if let Some(body) = (*co).body.take() {
            if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
                kerror!("{} panicked; aborting", (*co).id);
                std::process::abort();
            }
        }
        (*co).state.set(CoroutineState::Dead);
        arch::switch_context((*co).exec_point.get(), (*co).resume_point.get());
    }
}

fn current_or_panic(op: &str) -> *const Coroutine {
    let co = tls::current_ptr();
    if co.is_null() {
        panic!("{} called outside of a coroutine", op);
    }
    co
}

/// Switch back to whoever resumed the running coroutine
///
/// # Panics
///
/// When called outside a coroutine.
pub fn yield_now() {
    let co = current_or_panic("yield_now");
    unsafe {
        (*co).state.set(CoroutineState::Suspended);
        arch::switch_context((*co).exec_point.get(), (*co).resume_point.get());
    }
}

/// Yield, with a timer on `event_loop` that resumes the coroutine after
/// `timeout` if nothing else does first
///
/// Returns true when the wake-up came from the timer.
pub fn yield_with_timeout(event_loop: &Rc<EventLoop>, timeout: Duration) -> bool {
    let co = current_or_panic("yield_with_timeout");
    let (weak, id) = unsafe { ((*co).self_ref.clone(), (*co).id) };

    let timer = event_loop.run_after(timeout, move || {
        if let Some(co) = weak.upgrade() {
            co.pending_timeout.borrow_mut().take();
            co.timed_out.set(true);
            kdebug!("{} wait timed out", id);
            co.resume();
        }
    });

    unsafe {
        (*co).timed_out.set(false);
        *(*co).pending_timeout.borrow_mut() = Some((Rc::downgrade(event_loop), timer));
    }
    yield_now();
    unsafe { (*co).timed_out.get() }
}

/// Id of the running coroutine, `CoroutineId::NONE` outside one
#[inline]
pub fn current_id() -> CoroutineId {
    tls::current_id()
}

/// Check if we're running inside a coroutine
#[inline]
pub fn in_coroutine() -> bool {
    tls::in_coroutine()
}

/// Owning handle of the running coroutine, `None` outside one
pub fn current() -> Option<Rc<Coroutine>> {
    let co = tls::current_ptr();
    if co.is_null() {
        None
    } else {
        unsafe { (*co).self_ref.upgrade() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Instant;

    #[test]
    fn test_runs_to_completion() {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let co = Coroutine::new(move || h.set(h.get() + 1));
        assert_eq!(co.state(), CoroutineState::Ready);
        co.resume();
        assert_eq!(hits.get(), 1);
        assert!(co.is_dead());
        assert_eq!(co.saved_stack_len(), 0);
    }

    #[test]
    fn test_yield_and_resume() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let co = Coroutine::new(move || {
            l.borrow_mut().push(1);
            yield_now();
            l.borrow_mut().push(2);
            yield_now();
            l.borrow_mut().push(3);
        });

        co.resume();
        assert_eq!(co.state(), CoroutineState::Suspended);
        assert!(co.saved_stack_len() > 0);
        assert_eq!(*log.borrow(), vec![1]);

        co.resume();
        assert_eq!(*log.borrow(), vec![1, 2]);

        co.resume();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert!(co.is_dead());
    }

    #[test]
    fn test_interleaved_stacks_survive() {
        // Both coroutines occupy the same addresses; locals must come back intact.
        let out = Rc::new(RefCell::new(Vec::new()));
        let mk = |base: u64, out: Rc<RefCell<Vec<u64>>>| {
            Coroutine::new(move || {
                let mut local = [0u64; 64];
                for (i, v) in local.iter_mut().enumerate() {
                    *v = base + i as u64;
                }
                yield_now();
                out.borrow_mut().push(local.iter().sum());
                yield_now();
                out.borrow_mut().push(local[63]);
            })
        };
        let a = mk(1000, out.clone());
        let b = mk(5000, out.clone());

        a.resume();
        b.resume();
        b.resume();
        a.resume();
        a.resume();
        b.resume();

        let sum = |base: u64| (0..64).map(|i| base + i).sum::<u64>();
        assert_eq!(*out.borrow(), vec![sum(5000), sum(1000), 1063, 5063]);
        assert!(a.is_dead() && b.is_dead());
    }

    #[test]
    fn test_current_inside_coroutine() {
        assert!(!in_coroutine());
        assert!(current_id().is_none());

        let seen = Rc::new(Cell::new(CoroutineId::NONE));
        let s = seen.clone();
        let co = Coroutine::new(move || {
            assert!(in_coroutine());
            s.set(current_id());
            let me = current().unwrap();
            assert_eq!(me.state(), CoroutineState::Running);
        });
        co.resume();
        assert_eq!(seen.get(), co.id());
        assert!(!in_coroutine());
    }

    #[test]
    fn test_deep_recursion_is_saved() {
        fn depth(n: u32) -> u32 {
            let pad = [n as u8; 128];
            if n == 0 {
                yield_now();
                return pad[0] as u32;
            }
            depth(n - 1) + std::hint::black_box(pad)[1] as u32
        }
        let result = Rc::new(Cell::new(0));
        let r = result.clone();
        let co = Coroutine::new(move || r.set(depth(200)));
        co.resume();
        assert!(co.saved_stack_len() > 200 * 128);
        co.resume();
        assert_eq!(result.get(), (1..=200u32).map(|n| n as u8 as u32).sum::<u32>());
    }

    #[test]
    fn test_yield_with_timeout_expires() {
        let el = EventLoop::new().unwrap();
        let woke_by_timer = Rc::new(Cell::new(None));
        let w = woke_by_timer.clone();
        let e = el.clone();
        let co = Coroutine::new(move || w.set(Some(yield_with_timeout(&e, Duration::from_millis(10)))));
        co.resume();
        assert_eq!(el.timer_count(), 1);

        let start = Instant::now();
        while !co.is_dead() && start.elapsed() < Duration::from_secs(2) {
            el.run_once(Duration::from_millis(5)).unwrap();
        }
        assert_eq!(woke_by_timer.get(), Some(true));
        assert!(co.timed_out());
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(el.timer_count(), 0);
    }

    #[test]
    fn test_io_wakeup_cancels_timeout() {
        let el = EventLoop::new().unwrap();
        let woke_by_timer = Rc::new(Cell::new(None));
        let w = woke_by_timer.clone();
        let e = el.clone();
        let co = Coroutine::new(move || {
            w.set(Some(yield_with_timeout(&e, Duration::from_millis(20))));
            yield_now();
        });
        co.resume();
        assert_eq!(el.timer_count(), 1);

        // Woken by someone else before the deadline.
        co.resume();
        assert_eq!(woke_by_timer.get(), Some(false));
        assert_eq!(el.timer_count(), 0);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(60) {
            el.run_once(Duration::from_millis(5)).unwrap();
        }
        assert_eq!(co.state(), CoroutineState::Suspended);
        co.resume();
        assert!(co.is_dead());
    }

    #[test]
    #[should_panic(expected = "in state DEAD")]
    fn test_resume_dead_panics() {
        let co = Coroutine::new(|| {});
        co.resume();
        co.resume();
    }

    #[test]
    #[should_panic(expected = "outside of a coroutine")]
    fn test_yield_outside_panics() {
        yield_now();
    }
}
